use crate::model::{Minute, Span, Tier};

/// Scheduling constants: per-tier reserve durations, the open-booking
/// buffer and the class grid. Loaded once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingPolicy {
    pub reserve_30: Minute,
    pub reserve_60: Minute,
    pub reserve_90: Minute,
    /// Minimum gap between two open bookings of the same trainer.
    pub open_buffer: Minute,
    /// Class timetable cell width.
    pub grid: Minute,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self {
            reserve_30: 45,
            reserve_60: 75,
            reserve_90: 120,
            open_buffer: 15,
            grid: 30,
        }
    }
}

impl SchedulingPolicy {
    /// Minutes withheld from the calendar for a session of `tier`.
    pub fn reserve(&self, tier: Tier) -> Minute {
        match tier {
            Tier::Min30 => self.reserve_30,
            Tier::Min60 => self.reserve_60,
            Tier::Min90 => self.reserve_90,
        }
    }

    /// How much to reserve for a session starting with `remaining` free
    /// minutes ahead of it. The full reserve when it fits; only the session
    /// itself when the gap is exactly the session length; otherwise it
    /// cannot start there.
    pub fn reserved_minutes(&self, tier: Tier, remaining: Minute) -> Option<Minute> {
        let need = self.reserve(tier);
        if remaining >= need {
            Some(need)
        } else if remaining == tier.minutes() {
            Some(tier.minutes())
        } else {
            None
        }
    }

    /// Start of the grid cell containing `m`.
    pub fn cell_of(&self, m: Minute) -> Minute {
        m.div_euclid(self.grid) * self.grid
    }

    /// Every grid cell touched by `span`.
    pub fn cells(&self, span: Span) -> impl Iterator<Item = Minute> + use<> {
        let grid = self.grid;
        let first = self.cell_of(span.start);
        let last = self.cell_of(span.end - 1);
        (first..=last).step_by(grid as usize)
    }

    pub fn validate(&self) -> Result<(), String> {
        for tier in Tier::ALL {
            if self.reserve(tier) < tier.minutes() {
                return Err(format!(
                    "reserve for {tier}-minute sessions ({}) is shorter than the session",
                    self.reserve(tier)
                ));
            }
        }
        if self.open_buffer < 0 {
            return Err("open buffer must not be negative".into());
        }
        if self.grid <= 0 || 1440 % self.grid != 0 {
            return Err(format!("grid of {} minutes does not divide the day", self.grid));
        }
        Ok(())
    }

    /// Read overrides from `PTSCHED_RESERVE_30`, `PTSCHED_RESERVE_60`,
    /// `PTSCHED_RESERVE_90` and `PTSCHED_OPEN_BUFFER`.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut policy = Self::default();
        let fields: [(&str, &mut Minute); 4] = [
            ("PTSCHED_RESERVE_30", &mut policy.reserve_30),
            ("PTSCHED_RESERVE_60", &mut policy.reserve_60),
            ("PTSCHED_RESERVE_90", &mut policy.reserve_90),
            ("PTSCHED_OPEN_BUFFER", &mut policy.open_buffer),
        ];
        for (key, slot) in fields {
            if let Some(raw) = lookup(key) {
                *slot = raw
                    .trim()
                    .parse()
                    .map_err(|_| format!("{key}: expected minutes, got {raw:?}"))?;
            }
        }
        policy.validate()?;
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_reserves() {
        let p = SchedulingPolicy::default();
        assert_eq!(p.reserve(Tier::Min30), 45);
        assert_eq!(p.reserve(Tier::Min60), 75);
        assert_eq!(p.reserve(Tier::Min90), 120);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn reserved_minutes_fit_rules() {
        let p = SchedulingPolicy::default();
        assert_eq!(p.reserved_minutes(Tier::Min60, 120), Some(75));
        assert_eq!(p.reserved_minutes(Tier::Min60, 75), Some(75));
        assert_eq!(p.reserved_minutes(Tier::Min60, 60), Some(60));
        assert_eq!(p.reserved_minutes(Tier::Min60, 70), None);
        assert_eq!(p.reserved_minutes(Tier::Min60, 45), None);
        assert_eq!(p.reserved_minutes(Tier::Min30, 30), Some(30));
    }

    #[test]
    fn cells_cover_span() {
        let p = SchedulingPolicy::default();
        assert_eq!(p.cell_of(615), 600);
        assert_eq!(p.cells(Span::new(600, 675)).collect::<Vec<_>>(), vec![600, 630, 660]);
        assert_eq!(p.cells(Span::new(600, 630)).collect::<Vec<_>>(), vec![600]);
        assert_eq!(p.cells(Span::new(615, 645)).collect::<Vec<_>>(), vec![600, 630]);
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> =
            [("PTSCHED_RESERVE_60", "90"), ("PTSCHED_OPEN_BUFFER", " 10 ")].into();
        let p = SchedulingPolicy::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(p.reserve_60, 90);
        assert_eq!(p.open_buffer, 10);
        assert_eq!(p.reserve_30, 45);
    }

    #[test]
    fn env_rejects_garbage_and_short_reserves() {
        let bad = SchedulingPolicy::from_lookup(|k| {
            (k == "PTSCHED_RESERVE_30").then(|| "soon".to_string())
        });
        assert!(bad.unwrap_err().contains("PTSCHED_RESERVE_30"));

        let short = SchedulingPolicy::from_lookup(|k| {
            (k == "PTSCHED_RESERVE_90").then(|| "60".to_string())
        });
        assert!(short.is_err());
    }
}
