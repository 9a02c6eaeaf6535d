use std::time::Instant;

use geo::{BoundingRect, Distance, Haversine, LineString, Point, Rect};
use serde_json::{json, Value};
use shared::Coordinates;

pub const DEFAULT_ZOOM: u8 = 15;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationSample {
    pub coordinates: Coordinates,
    pub received_at: Instant,
}

/// Path recorded for one session: the seed at the start location followed
/// by every accepted sample in arrival order.
#[derive(Debug, Clone)]
pub struct Track {
    start: Coordinates,
    initial_center: Coordinates,
    samples: Vec<LocationSample>,
}

impl Track {
    pub fn seeded(start: Coordinates, live_hint: Option<Coordinates>) -> Self {
        Self {
            start,
            initial_center: live_hint.unwrap_or(start),
            samples: vec![LocationSample {
                coordinates: start,
                received_at: Instant::now(),
            }],
        }
    }

    pub fn record(&mut self, coordinates: Coordinates) -> LocationSample {
        let sample = LocationSample {
            coordinates,
            received_at: Instant::now(),
        };
        self.samples.push(sample);
        sample
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Renderable state derived from a [`Track`]. Pure: no I/O.
#[derive(Debug, Clone)]
pub struct TrackViewModel {
    track: Track,
}

impl From<Track> for TrackViewModel {
    fn from(track: Track) -> Self {
        Self { track }
    }
}

impl TrackViewModel {
    /// Latest sample, or the start location before any sample arrived.
    pub fn current_position(&self) -> Coordinates {
        self.track
            .samples
            .last()
            .map(|sample| sample.coordinates)
            .unwrap_or(self.track.start)
    }

    /// Oldest first, seed included.
    pub fn path(&self) -> Vec<Coordinates> {
        self.track.samples.iter().map(|sample| sample.coordinates).collect()
    }

    pub fn samples(&self) -> &[LocationSample] {
        &self.track.samples
    }

    pub fn should_recenter(&self, sample: &LocationSample) -> bool {
        Self::recenters_on(sample)
    }

    /// Every sample pans the view; there is no dead zone or throttling.
    pub fn recenters_on(_sample: &LocationSample) -> bool {
        true
    }

    pub fn start_marker(&self) -> Coordinates {
        self.track.start
    }

    pub fn live_marker(&self) -> Coordinates {
        self.current_position()
    }

    /// Where the map opens: the last live location the REST API knew of,
    /// else the start location.
    pub fn initial_center(&self) -> Coordinates {
        self.track.initial_center
    }

    pub fn zoom(&self) -> u8 {
        DEFAULT_ZOOM
    }

    pub fn line_string(&self) -> LineString<f64> {
        self.track
            .samples
            .iter()
            .map(|sample| (sample.coordinates.longitude, sample.coordinates.latitude))
            .collect::<Vec<_>>()
            .into()
    }

    pub fn bounds(&self) -> Option<Rect<f64>> {
        self.line_string().bounding_rect()
    }

    /// Great-circle length of the path in metres.
    pub fn distance_travelled_m(&self) -> f64 {
        self.track
            .samples
            .windows(2)
            .map(|pair| {
                let from = Point::new(pair[0].coordinates.longitude, pair[0].coordinates.latitude);
                let to = Point::new(pair[1].coordinates.longitude, pair[1].coordinates.latitude);
                Haversine::distance(from, to)
            })
            .sum()
    }

    /// GeoJSON feature for a line layer, coordinates in `[lng, lat]` order.
    pub fn route_geojson(&self) -> Value {
        let coordinates: Vec<[f64; 2]> = self
            .track
            .samples
            .iter()
            .map(|sample| sample.coordinates.lng_lat())
            .collect();
        json!({
            "type": "Feature",
            "properties": {},
            "geometry": {
                "type": "LineString",
                "coordinates": coordinates,
            }
        })
    }
}
