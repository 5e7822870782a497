//! Remote LED actuator interface.
//!
//! The capture orchestrator consumes this trait; it never owns the LED
//! hardware loop. Every call is request/response with a bounded timeout,
//! and every failure is reported as `false` (logged, non-fatal) so a
//! single bad link cannot stall a whole session.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// An RGB color command value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl FromStr for Rgb {
    type Err = String;

    /// Parse `"r,g,b"` with each component in 0..=255.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(format!("expected r,g,b, got {:?}", s));
        }
        let parse = |p: &str| -> Result<u8, String> {
            p.parse::<u8>()
                .map_err(|_| format!("invalid color component {:?}", p))
        };
        Ok(Rgb::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.r, self.g, self.b)
    }
}

/// Capability to drive individual LEDs on the installation.
///
/// Implementations must treat unreachable or rejecting endpoints as
/// `false`, never as a panic or a propagated error.
pub trait LedActuator {
    /// Probe the actuator; `true` when it is reachable and healthy.
    fn connect(&mut self) -> bool;
    /// Light one LED with the given color and overall brightness.
    fn light(&mut self, index: u32, color: Rgb, brightness: u8) -> bool;
    /// Turn one LED off.
    fn turn_off(&mut self, index: u32) -> bool;
    /// Turn every LED off.
    fn all_off(&mut self) -> bool;
    /// Liveness check without side effects.
    fn health(&mut self) -> bool;
}

/// HTTP-backed actuator client.
///
/// Speaks the control server's JSON API: `POST /led/on`, `POST /led/off`,
/// `POST /led/all_off`, `GET /health`, `GET /status`.
pub struct HttpActuator {
    base_url: String,
    agent: ureq::Agent,
    connected: bool,
}

impl HttpActuator {
    /// Client for `http://<host>:<port>` with a per-request timeout.
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            base_url: format!("http://{}:{}", host, port),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            connected: false,
        }
    }

    /// Whether the last `connect` succeeded.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Fetch the control server's status document, if reachable.
    pub fn status(&mut self) -> Option<serde_json::Value> {
        let url = format!("{}/status", self.base_url);
        match self.agent.get(&url).call() {
            Ok(resp) => resp.into_json().ok(),
            Err(e) => {
                tracing::warn!("status request failed: {}", e);
                None
            }
        }
    }

    fn post_json(&self, path: &str, body: serde_json::Value, what: &str) -> bool {
        let url = format!("{}{}", self.base_url, path);
        match self.agent.post(&url).send_json(body) {
            Ok(resp) => resp.status() == 200,
            Err(e) => {
                tracing::warn!("{} failed: {}", what, e);
                false
            }
        }
    }
}

impl LedActuator for HttpActuator {
    fn connect(&mut self) -> bool {
        let url = format!("{}/health", self.base_url);
        self.connected = match self.agent.get(&url).call() {
            Ok(resp) => {
                let body: Option<serde_json::Value> = resp.into_json().ok();
                body.and_then(|v| v.get("status").and_then(|s| s.as_str()).map(String::from))
                    .as_deref()
                    == Some("healthy")
            }
            Err(e) => {
                tracing::warn!("connection check failed: {}", e);
                false
            }
        };
        self.connected
    }

    fn light(&mut self, index: u32, color: Rgb, brightness: u8) -> bool {
        self.post_json(
            "/led/on",
            serde_json::json!({
                "index": index,
                "color": [color.r, color.g, color.b],
                "brightness": brightness,
            }),
            &format!("lighting LED {}", index),
        )
    }

    fn turn_off(&mut self, index: u32) -> bool {
        self.post_json(
            "/led/off",
            serde_json::json!({ "index": index }),
            &format!("turning off LED {}", index),
        )
    }

    fn all_off(&mut self) -> bool {
        self.post_json("/led/all_off", serde_json::json!({}), "all-off")
    }

    fn health(&mut self) -> bool {
        let url = format!("{}/health", self.base_url);
        self.agent
            .get(&url)
            .call()
            .map(|resp| resp.status() == 200)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_parses_and_displays() {
        let c: Rgb = "255, 0,64".parse().unwrap();
        assert_eq!(c, Rgb::new(255, 0, 64));
        assert_eq!(c.to_string(), "255,0,64");
    }

    #[test]
    fn rgb_rejects_bad_input() {
        assert!("255,0".parse::<Rgb>().is_err());
        assert!("256,0,0".parse::<Rgb>().is_err());
        assert!("red".parse::<Rgb>().is_err());
    }

    #[test]
    fn http_actuator_is_unreachable_without_server() {
        // Reserved TEST-NET address; connect must fail fast, not panic.
        let mut actuator = HttpActuator::new("192.0.2.1", 9, Duration::from_millis(50));
        assert!(!actuator.connect());
        assert!(!actuator.is_connected());
    }
}
