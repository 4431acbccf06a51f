//! Structured log records.
//!
//! Every record is a self-contained JSON object with a shared base
//! (`event_type`, `timestamp`, `router_name`, `user`); one record per line
//! in the output stream. Attribute maps are embedded as real JSON objects so
//! records round-trip through any standard parser.

use serde_json::{Map, Value};

use crate::clock;
use crate::netlink::event::AttrMap;

/// Identity fields stamped on every record.
#[derive(Debug, Clone)]
pub struct RecordContext {
    pub router_name: String,
    pub user: String,
}

/// One structured log record.
#[derive(Debug, Clone)]
pub struct Record(Map<String, Value>);

impl Record {
    /// New record with the shared base fields; `timestamp` is rendered from
    /// `timestamp_ms` as ISO-8601 UTC.
    pub fn new(event_type: &str, ctx: &RecordContext, timestamp_ms: i64) -> Self {
        let mut map = Map::new();
        map.insert("event_type".to_string(), Value::from(event_type));
        map.insert(
            "timestamp".to_string(),
            Value::from(clock::iso_utc(timestamp_ms)),
        );
        map.insert("router_name".to_string(), Value::from(ctx.router_name.as_str()));
        map.insert("user".to_string(), Value::from(ctx.user.as_str()));
        Self(map)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_line(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }
}

/// Render an attribute map as a JSON object value.
pub fn attrs_value(attrs: &AttrMap) -> Value {
    Value::Object(
        attrs
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect(),
    )
}

/// `monitoring_started`: emitted once, when the listener is up.
pub fn monitoring_started(
    ctx: &RecordContext,
    now_ms: i64,
    convergence_threshold_ms: i64,
    log_file_path: &str,
    monitor_id: &str,
) -> Record {
    let mut record = Record::new("monitoring_started", ctx, now_ms);
    record
        .set("convergence_threshold_ms", convergence_threshold_ms)
        .set("log_file_path", log_file_path)
        .set("monitor_id", monitor_id)
        .set("utc_time", clock::iso_utc(now_ms))
        .set("listen_start_time", clock::iso_utc(now_ms));
    record
}

/// `session_started`: a trigger event opened a measurement session.
pub fn session_started(
    ctx: &RecordContext,
    now_ms: i64,
    session_id: u64,
    trigger_source: &str,
    trigger_event_type: &str,
    trigger_info: &AttrMap,
) -> Record {
    let mut record = Record::new("session_started", ctx, now_ms);
    record
        .set("session_id", session_id)
        .set("trigger_source", trigger_source)
        .set("trigger_event_type", trigger_event_type)
        .set("trigger_info", attrs_value(trigger_info));
    record
}

/// `route_event`: one event appended to the live session.
#[allow(clippy::too_many_arguments)]
pub fn route_event(
    ctx: &RecordContext,
    timestamp_ms: i64,
    session_id: u64,
    route_event_type: &str,
    route_event_number: u64,
    session_event_number: usize,
    offset_from_trigger_ms: i64,
    route_info: &AttrMap,
) -> Record {
    let mut record = Record::new("route_event", ctx, timestamp_ms);
    record
        .set("session_id", session_id)
        .set("route_event_type", route_event_type)
        .set("route_event_number", route_event_number)
        .set("session_event_number", session_event_number)
        .set("offset_from_trigger_ms", offset_from_trigger_ms)
        .set("route_info", attrs_value(route_info));
    record
}

/// `netem_detected`: a netem-related qdisc notification was observed,
/// with the full attribute map of the qdisc.
pub fn netem_detected(
    ctx: &RecordContext,
    now_ms: i64,
    netem_event_type: &str,
    qdisc_info: &AttrMap,
) -> Record {
    let mut record = Record::new("netem_detected", ctx, now_ms);
    record
        .set("netem_event_type", netem_event_type)
        .set("qdisc_info", attrs_value(qdisc_info));
    record
}

/// `session_completed`: a session converged (or was force-finalized).
#[allow(clippy::too_many_arguments)]
pub fn session_completed(
    ctx: &RecordContext,
    now_ms: i64,
    session_id: u64,
    convergence_time_ms: Option<i64>,
    route_events_count: usize,
    session_duration_ms: i64,
    convergence_threshold_ms: i64,
    netem_info: &AttrMap,
) -> Record {
    let mut record = Record::new("session_completed", ctx, now_ms);
    record.set("session_id", session_id);
    if let Some(convergence_time_ms) = convergence_time_ms {
        record.set("convergence_time_ms", convergence_time_ms);
    }
    record
        .set("route_events_count", route_events_count)
        .set("session_duration_ms", session_duration_ms)
        .set("convergence_threshold_ms", convergence_threshold_ms)
        .set("netem_info", attrs_value(netem_info));
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RecordContext {
        RecordContext {
            router_name: "spine1".to_string(),
            user: "frr".to_string(),
        }
    }

    #[test]
    fn test_base_fields_present() {
        let record = Record::new("session_started", &ctx(), 1_609_459_200_000);
        assert_eq!(record.get("event_type"), Some(&Value::from("session_started")));
        assert_eq!(record.get("router_name"), Some(&Value::from("spine1")));
        assert_eq!(record.get("user"), Some(&Value::from("frr")));
        assert_eq!(
            record.get("timestamp"),
            Some(&Value::from("2021-01-01T00:00:00.000Z"))
        );
    }

    #[test]
    fn test_record_roundtrips_through_parser() {
        let mut info = AttrMap::new();
        info.insert("interface".to_string(), "eth0".to_string());
        info.insert("kind".to_string(), "netem".to_string());

        let record = session_started(&ctx(), 0, 7, "netem", "QDISC_ADD", &info);
        let line = record.to_line();

        let parsed: Value = serde_json::from_str(&line).expect("valid JSON");
        assert_eq!(parsed["session_id"], 7);
        assert_eq!(parsed["trigger_source"], "netem");
        assert_eq!(parsed["trigger_info"]["interface"], "eth0");
    }

    #[test]
    fn test_route_event_numbering_fields() {
        let record = route_event(&ctx(), 1_500, 2, "ROUTE_ADD", 14, 3, 500, &AttrMap::new());
        assert_eq!(record.get("route_event_number"), Some(&Value::from(14)));
        assert_eq!(record.get("session_event_number"), Some(&Value::from(3)));
        assert_eq!(record.get("offset_from_trigger_ms"), Some(&Value::from(500)));
    }

    #[test]
    fn test_session_completed_omits_missing_convergence_time() {
        let record = session_completed(&ctx(), 0, 1, None, 0, 100, 3_000, &AttrMap::new());
        assert!(record.get("convergence_time_ms").is_none());

        let record = session_completed(&ctx(), 0, 1, Some(120), 2, 1_120, 1_000, &AttrMap::new());
        assert_eq!(record.get("convergence_time_ms"), Some(&Value::from(120)));
    }

    #[test]
    fn test_netem_detected_carries_full_attr_map() {
        let mut info = AttrMap::new();
        info.insert("interface".to_string(), "eth0".to_string());
        info.insert("is_netem".to_string(), "true".to_string());

        let record = netem_detected(&ctx(), 0, "QDISC_DEL", &info);
        let parsed: Value = serde_json::from_str(&record.to_line()).expect("valid JSON");
        assert_eq!(parsed["qdisc_info"]["is_netem"], "true");
        assert_eq!(parsed["netem_event_type"], "QDISC_DEL");
    }
}
