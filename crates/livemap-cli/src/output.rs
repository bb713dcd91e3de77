//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag), one object per line while watching
//! - Quiet mode for scripting (--quiet flag)

use chrono::Local;
use serde_json::json;

use livemap_core::{Category, ConnectionState, Marker, Point, SyncEvent, TickReport};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
#[derive(Debug, Clone, Copy)]
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Print one sync event as it arrives
    pub fn event(&self, event: &SyncEvent) {
        match self.format {
            OutputFormat::Human => println!("[{}] {}", timestamp(), describe_event(event)),
            OutputFormat::Json => println!("{}", event_json(event)),
            OutputFormat::Quiet => {}
        }
    }

    /// Print what the surface shows after a tick
    pub fn tick(&self, report: &TickReport, markers: &[Marker], points: usize) {
        match self.format {
            OutputFormat::Human => {
                let (red, green) = count_by_fill(markers);
                println!(
                    "[{}] {} markers ({} red, {} green) for {} points | +{} ~{} -{}{}",
                    timestamp(),
                    markers.len(),
                    red,
                    green,
                    points,
                    report.added,
                    report.updated,
                    report.removed,
                    if report.failed > 0 {
                        format!(" ({} failed)", report.failed)
                    } else {
                        String::new()
                    }
                );
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    json!({
                        "event": "tick",
                        "markers": markers.len(),
                        "points": points,
                        "report": report,
                    })
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!("{}", json!({"status": "success", "message": message}));
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

fn count_by_fill(markers: &[Marker]) -> (usize, usize) {
    let red_fill = livemap_core::MarkerStyle::for_category(Category::Red).fill_color;
    let red = markers
        .iter()
        .filter(|m| m.style.fill_color == red_fill)
        .count();
    (red, markers.len() - red)
}

fn describe_point(point: &Point) -> String {
    format!(
        "{} at ({:.5}, {:.5}) [{}]",
        point.id, point.position.lat, point.position.lng, point.category
    )
}

fn describe_state(state: &ConnectionState) -> String {
    let error = state
        .error
        .as_ref()
        .map(|e| format!(": {}", e.message))
        .unwrap_or_default();

    if state.connected {
        match &state.connection_id {
            Some(id) => format!("connected ({})", id),
            None => "connected".to_string(),
        }
    } else if state.reconnecting {
        format!("reconnecting{}", error)
    } else {
        format!("disconnected{}", error)
    }
}

fn describe_event(event: &SyncEvent) -> String {
    match event {
        SyncEvent::Message(text) => format!("message: {}", text),
        SyncEvent::StateChange(point) => format!("update: {}", describe_point(point)),
        SyncEvent::Initialize(points) => format!("initial state: {} points", points.len()),
        SyncEvent::ConnectionState(state) => describe_state(state),
        SyncEvent::Removed(id) => format!("removed: {}", id),
    }
}

fn event_json(event: &SyncEvent) -> serde_json::Value {
    let kind = event.kind().name();
    match event {
        SyncEvent::Message(text) => json!({"event": kind, "text": text}),
        SyncEvent::StateChange(point) => json!({"event": kind, "point": point.to_payload()}),
        SyncEvent::Initialize(points) => {
            let points: Vec<_> = points.iter().map(Point::to_payload).collect();
            json!({"event": kind, "points": points})
        }
        SyncEvent::ConnectionState(state) => json!({"event": kind, "state": state}),
        SyncEvent::Removed(id) => json!({"event": kind, "id": id}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livemap_core::dispatcher::ErrorInfo;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_describe_state() {
        assert_eq!(
            describe_state(&ConnectionState::connected(Some("abc".to_string()))),
            "connected (abc)"
        );
        assert_eq!(
            describe_state(&ConnectionState::reconnecting(Some(ErrorInfo::new("reset")))),
            "reconnecting: reset"
        );
        assert_eq!(describe_state(&ConnectionState::closed(None)), "disconnected");
    }

    #[test]
    fn test_event_json_uses_wire_names() {
        let event = SyncEvent::StateChange(Point::new("dev-1", 1.5, 2.5, Category::Green));
        let value = event_json(&event);
        assert_eq!(value["event"], "state-change");
        assert_eq!(value["point"]["imei"], "dev-1");
        assert_eq!(value["point"]["c"], "G");
    }

    #[test]
    fn test_count_by_fill() {
        let markers: Vec<Marker> = [
            Point::new("a", 0.0, 0.0, Category::Red),
            Point::new("b", 0.0, 0.0, Category::Green),
            Point::new("c", 0.0, 0.0, Category::Red),
        ]
        .iter()
        .map(Marker::from_point)
        .collect();
        assert_eq!(count_by_fill(&markers), (2, 1));
    }
}
