use std::sync::Mutex;

use newsarc_nntp::{StatusSink, SyncEvent};

/// Stdout status line in the `percent | target | action | number(requested): id`
/// layout.
pub(crate) struct ConsoleStatus {
    quiet: bool,
    percent: Mutex<String>,
}

impl ConsoleStatus {
    pub(crate) fn new(quiet: bool) -> Self {
        Self {
            quiet,
            percent: Mutex::new("0 %".to_string()),
        }
    }
}

impl StatusSink for ConsoleStatus {
    fn event(&self, event: &SyncEvent) {
        if self.quiet {
            return;
        }
        let status = self
            .percent
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        println!("{}", format_event(&status, event));
    }

    fn progress(&self, percent: u8) {
        if let Ok(mut status) = self.percent.lock() {
            *status = format!("{percent} %");
        }
    }
}

fn format_event(status: &str, event: &SyncEvent) -> String {
    format!(
        "{:>5} | {:<4} | {:<5} | {}({}): {}",
        status,
        event.target.to_string(),
        event.action.to_string(),
        event.number,
        event.requested,
        event.message_id
    )
}

#[cfg(test)]
mod tests {
    use newsarc_nntp::{EventAction, EventTarget, SyncEvent};

    use super::format_event;

    #[test]
    fn format_event_keeps_column_layout() {
        let event = SyncEvent {
            target: EventTarget::Nntp,
            action: EventAction::Stat,
            number: 12,
            requested: 12,
            message_id: "<a@x>".to_string(),
        };
        assert_eq!(format_event("50 %", &event), " 50 % | nntp | STAT  | 12(12): <a@x>");
    }

    #[test]
    fn format_event_pads_short_targets() {
        let event = SyncEvent {
            target: EventTarget::Db,
            action: EventAction::Queue,
            number: 3,
            requested: 3,
            message_id: "<b@y>".to_string(),
        };
        assert_eq!(format_event("0 %", &event), "  0 % | db   | QUEUE | 3(3): <b@y>");
    }
}
