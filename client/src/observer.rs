//! Forwarding results and the observer that receives them.
//!
//! Both the tunnel forwarder (inbound) and the capture relay (outbound)
//! report one [`ForwardResult`] per request. Observers are for display
//! only and never influence control flow.

use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Relay -> local service
    Inbound,
    /// Local process -> capture sink
    Outbound,
}

impl Direction {
    pub fn label(&self) -> &'static str {
        match self {
            Direction::Inbound => "INBOUND",
            Direction::Outbound => "OUTBOUND",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardResult {
    pub direction: Direction,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub duration: Duration,
}

impl ForwardResult {
    pub fn duration_millis(&self) -> u128 {
        self.duration.as_millis()
    }
}

pub trait ForwardObserver: Send + Sync {
    fn on_forward_result(&self, result: &ForwardResult);
}

impl<F> ForwardObserver for F
where
    F: Fn(&ForwardResult) + Send + Sync,
{
    fn on_forward_result(&self, result: &ForwardResult) {
        self(result)
    }
}

pub type SharedObserver = Arc<dyn ForwardObserver>;

/// Prints one line per forwarded request to stdout.
pub struct ConsoleObserver;

impl ForwardObserver for ConsoleObserver {
    fn on_forward_result(&self, result: &ForwardResult) {
        let now = chrono::Local::now().format("%H:%M:%S").to_string();
        println!("{}", format_line(result, &now));
    }
}

pub fn format_line(result: &ForwardResult, timestamp: &str) -> String {
    format!(
        "[{}] {:<8} {:<6} {:<30} {:<3} ({}ms)",
        timestamp,
        result.direction.label(),
        result.method,
        result.path,
        result.status_code,
        result.duration_millis()
    )
}
