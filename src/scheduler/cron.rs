//! Cron expression normalization.
//!
//! Jobs are stored with a canonical 5-field expression
//! (`minute hour day-of-month month day-of-week`). The timer wants a leading
//! seconds field and named weekdays, which [`to_trigger_expression`] adds.

use super::SchedulerError;

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

fn valid_field(field: &str) -> bool {
    !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '*' | '/' | ',' | '-' | '?'))
}

/// Normalize user input to a canonical 5-field expression.
///
/// - one field: `*` means every minute, anything else is the minute of every hour
/// - four fields: a wildcard day-of-week is appended
/// - five fields: unchanged
pub fn normalize_cron(expr: &str) -> Result<String, SchedulerError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if let Some(bad) = fields.iter().find(|f| !valid_field(f)) {
        return Err(SchedulerError::InvalidCron(format!(
            "'{}': invalid field '{}'",
            expr, bad
        )));
    }
    match fields.len() {
        1 if fields[0] == "*" => Ok("* * * * *".to_string()),
        1 => Ok(format!("{} * * * *", fields[0])),
        4 => Ok(format!("{} *", fields.join(" "))),
        5 => Ok(fields.join(" ")),
        n => Err(SchedulerError::InvalidCron(format!(
            "'{}': expected 1, 4 or 5 fields, got {}",
            expr, n
        ))),
    }
}

fn weekday_name(token: &str) -> Result<String, SchedulerError> {
    match token.parse::<usize>() {
        Ok(n) if n <= 7 => Ok(WEEKDAYS[n % 7].to_string()),
        Ok(n) => Err(SchedulerError::InvalidCron(format!(
            "day-of-week {} out of range",
            n
        ))),
        Err(_) => Ok(token.to_uppercase()),
    }
}

/// Translate one comma-separated item of a day-of-week field.
fn weekday_item(item: &str) -> Result<String, SchedulerError> {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (item, None),
    };
    let base = match base.split_once('-') {
        Some((start, end)) => {
            let start_n = start.parse::<usize>().ok();
            let end_n = end.parse::<usize>().ok();
            // 7 closes a range on Sunday; the timer needs it spelled out
            if step.is_none() && end_n == Some(7) && start_n.map(|s| s > 0).unwrap_or(false) {
                let start_name = weekday_name(start)?;
                return Ok(if start_n == Some(6) {
                    "SAT,SUN".to_string()
                } else {
                    format!("{}-SAT,SUN", start_name)
                });
            }
            format!("{}-{}", weekday_name(start)?, weekday_name(end)?)
        }
        None if base == "*" || base == "?" => base.to_string(),
        None => weekday_name(base)?,
    };
    Ok(match step {
        Some(step) => format!("{}/{}", base, step),
        None => base,
    })
}

/// Expression handed to the timer: seconds field prepended, numeric
/// weekdays (0 or 7 = Sunday) replaced by names.
pub fn to_trigger_expression(canonical: &str) -> Result<String, SchedulerError> {
    let canonical = normalize_cron(canonical)?;
    let fields: Vec<&str> = canonical.split(' ').collect();
    let weekdays = fields[4]
        .split(',')
        .map(weekday_item)
        .collect::<Result<Vec<_>, _>>()?
        .join(",");
    Ok(format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], weekdays
    ))
}
