//! Subscriber that prints events as JSON lines.

use std::io::Write;
use std::sync::Mutex;

use bluedroid_core::{DeliveryError, Endpoint};
use bluedroid_types::Event;

/// Writes each event as one JSON object per line.
///
/// A failed write (for example a closed pipe) deregisters the endpoint.
pub struct ConsoleEndpoint<W> {
    out: Mutex<W>,
}

impl ConsoleEndpoint<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> ConsoleEndpoint<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<W: Write + Send> Endpoint for ConsoleEndpoint<W> {
    fn deliver(&self, event: &Event) -> Result<(), DeliveryError> {
        let line =
            serde_json::to_string(event).map_err(|e| DeliveryError::Failed(e.to_string()))?;
        let mut out = self
            .out
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writeln!(out, "{}", line)
            .and_then(|_| out.flush())
            .map_err(|e| DeliveryError::Failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_writes_json_lines() {
        let endpoint = ConsoleEndpoint::new(Vec::new());
        endpoint.deliver(&Event::status("Connected to AA.")).unwrap();
        endpoint.deliver(&Event::BatteryLevel(87)).unwrap();

        let text = String::from_utf8(endpoint.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                r#"{"type":"status","data":"Connected to AA."}"#,
                r#"{"type":"battery_level","data":87}"#,
            ]
        );
    }

    #[test]
    fn test_write_failure_is_reported() {
        let endpoint = ConsoleEndpoint::new(Broken);
        let result = endpoint.deliver(&Event::SensorStarted);
        assert!(matches!(result, Err(DeliveryError::Failed(_))));
    }
}
