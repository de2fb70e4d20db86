//! Priority scoring for the unassigned queue.
//!
//! `score = base(priority) + min(waiting_hours * 10, 50) + min(message_count * 2, 20)`,
//! rounded to the nearest integer. Priority steps are 25 points, the two
//! secondary terms are capped, so no score exceeds 170.

use chrono::{DateTime, Duration, Utc};

use super::models::{Conversation, Priority};

/// Points contributed per hour of waiting.
const WAIT_POINTS_PER_HOUR: f64 = 10.0;
const WAIT_CAP: f64 = 50.0;
/// Points contributed per message.
const MESSAGE_POINTS: f64 = 2.0;
const MESSAGE_CAP: f64 = 20.0;

pub const MAX_SCORE: i64 = 170;

/// Base points for a priority tier.
pub fn base(priority: Priority) -> f64 {
    match priority {
        Priority::Low => 25.0,
        Priority::Medium => 50.0,
        Priority::High => 75.0,
        Priority::Urgent => 100.0,
    }
}

/// Score from raw inputs. Negative waiting time counts as zero.
pub fn score(priority: Priority, waiting: Duration, message_count: i64) -> i64 {
    let waiting_hours = waiting.num_milliseconds().max(0) as f64 / 3_600_000.0;
    let wait_points = (waiting_hours * WAIT_POINTS_PER_HOUR).min(WAIT_CAP);
    let message_points = (message_count.max(0) as f64 * MESSAGE_POINTS).min(MESSAGE_CAP);

    (base(priority) + wait_points + message_points).round() as i64
}

/// Time a conversation has spent in its current status, measured at `now`.
pub fn waiting_time(conversation: &Conversation, now: DateTime<Utc>) -> Duration {
    let waited = now - conversation.status_changed_at;
    if waited < Duration::zero() {
        Duration::zero()
    } else {
        waited
    }
}

/// Score a conversation as of `now`.
pub fn score_conversation(conversation: &Conversation, now: DateTime<Utc>) -> i64 {
    score(
        conversation.priority,
        waiting_time(conversation, now),
        conversation.message_count,
    )
}

/// Human-readable waiting time, always truncating.
///
/// `2d 3h`, `1h 5m`, `4m`, `30s`.
pub fn format_waiting_time(waiting: Duration) -> String {
    let total = waiting.num_seconds().max(0);
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    if days >= 1 {
        format!("{}d {}h", days, hours)
    } else if hours >= 1 {
        format!("{}h {}m", hours, minutes)
    } else if minutes >= 1 {
        format!("{}m", minutes)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urgent_two_hours_three_messages() {
        assert_eq!(score(Priority::Urgent, Duration::hours(2), 3), 126);
    }

    #[test]
    fn test_score_is_replayable() {
        let now = Utc::now();
        let mut conv = Conversation::new("cust", "widget", Priority::High, now - Duration::minutes(95));
        conv.message_count = 4;

        let first = score_conversation(&conv, now);
        let second = score_conversation(&conv, now);
        assert_eq!(first, second);
        // 75 + 15.83 + 8 = 98.83
        assert_eq!(first, 99);
    }

    #[test]
    fn test_caps_bound_the_score() {
        assert_eq!(score(Priority::Urgent, Duration::days(30), 10_000), MAX_SCORE);
        assert_eq!(score(Priority::Low, Duration::hours(5), 10), 25 + 50 + 20);
        assert_eq!(score(Priority::Low, Duration::hours(6), 11), 95);
    }

    #[test]
    fn test_monotonic_in_each_input() {
        let tiers = [Priority::Low, Priority::Medium, Priority::High, Priority::Urgent];
        for pair in tiers.windows(2) {
            assert!(score(pair[0], Duration::hours(1), 2) < score(pair[1], Duration::hours(1), 2));
        }

        let mut last = 0;
        for minutes in (0..=600).step_by(15) {
            let s = score(Priority::Medium, Duration::minutes(minutes), 0);
            assert!(s >= last);
            last = s;
        }

        let mut last = 0;
        for count in 0..=20 {
            let s = score(Priority::Medium, Duration::zero(), count);
            assert!(s >= last);
            last = s;
        }
    }

    #[test]
    fn test_negative_wait_counts_as_zero() {
        assert_eq!(score(Priority::Low, Duration::hours(-3), 0), 25);

        let now = Utc::now();
        let conv = Conversation::new("cust", "widget", Priority::Low, now + Duration::minutes(5));
        assert_eq!(waiting_time(&conv, now), Duration::zero());
    }

    #[test]
    fn test_format_waiting_time_truncates() {
        assert_eq!(format_waiting_time(Duration::seconds(0)), "0s");
        assert_eq!(format_waiting_time(Duration::seconds(59)), "59s");
        assert_eq!(format_waiting_time(Duration::seconds(119)), "1m");
        assert_eq!(format_waiting_time(Duration::seconds(3_599)), "59m");
        assert_eq!(format_waiting_time(Duration::seconds(3_600 + 59 * 60 + 59)), "1h 59m");
        assert_eq!(format_waiting_time(Duration::hours(23) + Duration::minutes(59)), "23h 59m");
        assert_eq!(format_waiting_time(Duration::days(2) + Duration::hours(3) + Duration::minutes(50)), "2d 3h");
    }
}
