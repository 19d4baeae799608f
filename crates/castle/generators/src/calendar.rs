//! Cron to systemd `OnCalendar=` translation.
//!
//! systemd ANDs day-of-month and day-of-week where cron ORs them when both
//! are restricted. Expressions that restrict both fire on the intersection.

use castle_types::{CronField, CronSchedule};

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// `OnCalendar=` value for `cron` in `timezone`.
pub fn on_calendar(cron: &CronSchedule, timezone: &str) -> String {
    let date = format!(
        "*-{}-{}",
        render(&cron.month, 1),
        render(&cron.day_of_month, 1)
    );
    let time = format!("{}:{}:00", render(&cron.hour, 0), render(&cron.minute, 0));

    let mut out = String::new();
    if let Some(days) = weekdays(&cron.day_of_week) {
        out.push_str(&days);
        out.push(' ');
    }
    out.push_str(&date);
    out.push(' ');
    out.push_str(&time);
    let timezone = timezone.trim();
    if !timezone.is_empty() {
        out.push(' ');
        out.push_str(timezone);
    }
    out
}

fn render(field: &CronField, first: u8) -> String {
    match field {
        CronField::Any => "*".to_string(),
        CronField::Every(step) => format!("{}/{}", first, step),
        CronField::Values(values) => values
            .iter()
            .map(|v| format!("{:02}", v))
            .collect::<Vec<_>>()
            .join(","),
    }
}

fn weekdays(field: &CronField) -> Option<String> {
    let days: Vec<u8> = match field {
        CronField::Any => return None,
        CronField::Every(step) => (0..7).step_by(*step as usize).collect(),
        CronField::Values(values) => values.iter().copied().collect(),
    };
    Some(
        days.iter()
            .filter_map(|d| WEEKDAYS.get(*d as usize))
            .copied()
            .collect::<Vec<_>>()
            .join(","),
    )
}
