use std::collections::HashMap;

/// An alert raised when an ingested value exceeded its sensor's threshold.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Alert {
    pub sensor_id: String,
    pub value: f64,
    pub threshold: f64,
    pub timestamp: String,
    pub message: String,
}

/// AlertManager keeps a per-sensor numeric threshold table and an
/// append-only log of threshold violations. It is invoked synchronously
/// after every accepted write.
#[derive(Debug, Default)]
pub struct AlertManager {
    thresholds: HashMap<String, f64>,
    alerts: Vec<Alert>,
}

impl AlertManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or overwrite) the threshold for `sensor_id`.
    pub fn set_threshold(&mut self, sensor_id: &str, threshold: f64) {
        self.thresholds.insert(sensor_id.to_string(), threshold);
    }

    /// Best-effort anomaly check for a just-written measurement. Keys that
    /// are not of the form `<sensor_id>:<timestamp>`, sensors without a
    /// threshold, and non-numeric values are all silently ignored.
    pub fn check(&mut self, key: &str, value: &str) {
        let mut parts = key.split(':');
        let (Some(sensor_id), Some(timestamp), None) = (parts.next(), parts.next(), parts.next())
        else {
            return;
        };
        let Some(&threshold) = self.thresholds.get(sensor_id) else {
            return;
        };
        let Ok(value) = value.parse::<f64>() else {
            return;
        };

        if value > threshold {
            tracing::warn!(sensor_id, value, threshold, timestamp, "anomaly detected");
            self.alerts.push(Alert {
                sensor_id: sensor_id.to_string(),
                value,
                threshold,
                timestamp: timestamp.to_string(),
                message: "Anomaly detected: value exceeds threshold".to_string(),
            });
        }
    }

    /// All alerts raised so far, in append order.
    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alert_appended_only_above_threshold() {
        let mut manager = AlertManager::new();
        manager.set_threshold("s1", 5.0);

        manager.check("s1:1", "7");
        manager.check("s1:2", "3");
        manager.check("s1:3", "5"); // equal is not an anomaly

        assert_eq!(
            manager.alerts(),
            &[Alert {
                sensor_id: "s1".to_string(),
                value: 7.0,
                threshold: 5.0,
                timestamp: "1".to_string(),
                message: "Anomaly detected: value exceeds threshold".to_string(),
            }]
        );
    }

    #[test]
    fn malformed_input_is_ignored() {
        let mut manager = AlertManager::new();
        manager.set_threshold("s1", 5.0);

        manager.check("s1:3", "abc"); // non-numeric value
        manager.check("no-colon", "9"); // unsplittable key
        manager.check("s1:2:extra", "9"); // too many segments
        manager.check("s2:1", "9"); // no threshold for this sensor

        assert!(manager.alerts().is_empty());
    }

    #[test]
    fn threshold_overwrite_takes_effect() {
        let mut manager = AlertManager::new();
        manager.set_threshold("s1", 10.0);
        manager.check("s1:1", "7");
        assert!(manager.alerts().is_empty());

        manager.set_threshold("s1", 5.0);
        manager.check("s1:2", "7");
        assert_eq!(manager.alerts().len(), 1);
        assert_eq!(manager.alerts()[0].timestamp, "2");
    }
}
