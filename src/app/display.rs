use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::events::{CooperativeMethod, Event};
use crate::core::reporter::Reporter;

/// Prints coordinator events as they happen, either as text lines prefixed
/// with a timestamp or as one JSON object per line.
#[derive(Debug, Clone, Copy)]
pub struct EventPrinter {
    json: bool,
}

impl EventPrinter {
    pub fn new(json: bool) -> Self {
        Self { json }
    }
}

impl Reporter for EventPrinter {
    fn report(&mut self, event: Event) {
        if self.json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => log::warn!("failed to serialize event: {err}"),
            }
            return;
        }

        let line = render_event(&event);
        let stamp = timestamp();
        if line.warning {
            eprintln!("[{stamp}] Warning: {}", line.text);
        } else {
            println!("[{stamp}] {}", line.text);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedLine {
    pub text: String,
    pub warning: bool,
}

impl RenderedLine {
    fn info(text: String) -> Self {
        Self {
            text,
            warning: false,
        }
    }

    fn warning(text: String) -> Self {
        Self {
            text,
            warning: true,
        }
    }
}

pub fn render_event(event: &Event) -> RenderedLine {
    match event {
        Event::ShutdownArmed {
            vm,
            delay_ms,
            rearmed,
        } => {
            let verb = if *rearmed { "re-armed" } else { "armed" };
            if *delay_ms == 0 {
                RenderedLine::info(format!("→ {vm}: shutdown {verb}; stopping now."))
            } else {
                RenderedLine::info(format!(
                    "→ {vm}: shutdown {verb}; stopping in {}.",
                    format_duration_ms(*delay_ms)
                ))
            }
        }
        Event::CountdownCancelled { vm, remaining_ms } => RenderedLine::info(format!(
            "→ {vm}: shutdown cancelled with {} left.",
            format_duration_ms(*remaining_ms)
        )),
        Event::GuestWarned { vm, minutes } => {
            let unit = if *minutes == 1 { "minute" } else { "minutes" };
            RenderedLine::info(format!(
                "→ {vm}: warned guest users of power-off in {minutes} {unit}."
            ))
        }
        Event::ShutdownRequested { vm } => {
            RenderedLine::info(format!("→ {vm}: shutdown requested."))
        }
        Event::MountsStopped { vm } => RenderedLine::info(format!("→ {vm}: host mounts detached.")),
        Event::MountStopFailed { vm, detail } => RenderedLine::warning(format!(
            "{vm}: failed to detach host mounts ({detail}); continuing."
        )),
        Event::CooperativeAttempted {
            vm,
            method,
            timeout_ms,
        } => match method {
            CooperativeMethod::Ssh => RenderedLine::info(format!(
                "→ {vm}: attempting cooperative shutdown via {} (wait up to {}).",
                method.describe(),
                format_duration_ms(*timeout_ms)
            )),
            CooperativeMethod::Unavailable => RenderedLine::info(format!(
                "→ {vm}: no cooperative shutdown channel available; proceeding to power-off."
            )),
        },
        Event::CooperativeSucceeded { vm, elapsed_ms } => RenderedLine::info(format!(
            "→ {vm}: guest accepted shutdown in {}.",
            format_duration_ms(*elapsed_ms)
        )),
        Event::CooperativeFailed {
            vm,
            waited_ms,
            reason,
            detail,
        } => {
            let reason_text = reason.describe();
            match detail {
                Some(detail) if !detail.is_empty() => RenderedLine::info(format!(
                    "→ {vm}: cooperative shutdown {reason_text} after {} ({detail}).",
                    format_duration_ms(*waited_ms)
                )),
                _ => RenderedLine::info(format!(
                    "→ {vm}: cooperative shutdown {reason_text} after {}.",
                    format_duration_ms(*waited_ms)
                )),
            }
        }
        Event::PowerOffRequested { vm } => {
            RenderedLine::info(format!("→ {vm}: forcing power-off."))
        }
        Event::ShutdownComplete { vm, path, total_ms } => RenderedLine::info(format!(
            "→ {vm}: stopped ({}) in {}.",
            path.as_str(),
            format_duration_ms(*total_ms)
        )),
        Event::ShutdownFailed {
            vm,
            total_ms,
            error,
        } => RenderedLine::warning(format!(
            "{vm}: power-off failed after {}: {error}",
            format_duration_ms(*total_ms)
        )),
    }
}

pub fn format_duration_ms(ms: u64) -> String {
    if ms == 0 {
        return "0s".to_string();
    }

    if ms % 1000 == 0 {
        let secs = ms / 1000;
        if secs >= 60 && secs % 60 == 0 {
            return format!("{}m", secs / 60);
        }
        return format!("{secs}s");
    }

    let seconds = ms as f64 / 1000.0;
    if seconds >= 1.0 {
        format!("{seconds:.1}s")
    } else {
        format!("{ms}ms")
    }
}

/// Render whole seconds as `1h02m03s`, `4m05s`, or `6s`.
pub fn format_remaining(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{hours}h{minutes:02}m{seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "-".to_string())
}
