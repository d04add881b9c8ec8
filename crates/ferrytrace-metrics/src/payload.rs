//! Event batch payload
//!
//! ```json
//! {
//!   "application": "demo",
//!   "appversion": "1.2.0",
//!   "metadata": { "dropped_events": 0 },
//!   "unique_events": [ ... ]
//! }
//! ```
//!
//! The events key depends on the kind (`unique_events` or `summed_events`).

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use crate::queue::EventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EventsMetadata {
    /// Failed attempts of this batch so far
    pub dropped_events: u32,
}

/// One batch of events as sent to the collector
#[derive(Debug, Clone)]
pub struct EventsPayload<E> {
    pub application: String,
    pub application_version: String,
    pub metadata: EventsMetadata,
    pub events: Vec<E>,
}

impl<E: EventKind> Serialize for EventsPayload<E> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry("application", &self.application)?;
        map.serialize_entry("appversion", &self.application_version)?;
        map.serialize_entry("metadata", &self.metadata)?;
        map.serialize_entry(E::PAYLOAD_KEY, &self.events)?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use ferrytrace_core::domain::{Attributes, SummedEvent};

    use super::*;

    #[test]
    fn test_summed_payload_shape() {
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let payload = EventsPayload {
            application: "demo".to_string(),
            application_version: "1.2.0".to_string(),
            metadata: EventsMetadata { dropped_events: 2 },
            events: vec![SummedEvent::new("Application Launches", timestamp, Attributes::new()).unwrap()],
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["application"], "demo");
        assert_eq!(json["appversion"], "1.2.0");
        assert_eq!(json["metadata"]["dropped_events"], 2);
        assert_eq!(json["summed_events"][0]["metric_group"], "Application Launches");
        assert_eq!(json["summed_events"][0]["timestamp"], timestamp.timestamp());
        assert!(json.get("unique_events").is_none());
    }
}
