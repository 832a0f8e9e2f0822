//! Hysteresis controller adjusting the charge power limit from household power samples.
//!
//! Total power above `upper_limit` (or below `lower_limit` while there is headroom) opens a
//! debounce window. Every sample taken while the window stays open records its excursion; when
//! the window's timer expires the limit moves by the median excursion and a cooldown starts,
//! during which samples are ignored. A sample back inside the band drops the window.

use std::time::Duration;

use tracing::{debug, info};

use crate::interceptor::RateLimiter;
use crate::scheduler::{Scheduler, TimerHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Site fuse ceiling, W
    pub upper_limit: u32,
    /// Deadband floor, W
    pub lower_limit: u32,
    pub max_charge_power: u32,
    pub min_charge_power: u32,
    pub debounce_delay: Duration,
    pub cooldown_period: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    High,
    Low,
}

#[derive(Debug)]
struct ExcursionWindow {
    direction: Direction,
    timer: TimerHandle,
    samples: Vec<u32>,
}

#[derive(Debug)]
enum State {
    Idle,
    Excursion(ExcursionWindow),
    Cooldown(TimerHandle),
}

/// Observable summary of [`RateController`]'s state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    HighExcursion,
    LowExcursion,
    Cooldown,
}

#[derive(Debug)]
pub struct RateController<S> {
    settings: ControllerSettings,
    scheduler: S,
    state: State,
}

impl<S: Scheduler> RateController<S> {
    pub fn new(settings: ControllerSettings, scheduler: S) -> Self {
        Self {
            settings,
            scheduler,
            state: State::Idle,
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    pub fn phase(&self) -> Phase {
        match &self.state {
            State::Idle => Phase::Idle,
            State::Excursion(window) if window.direction == Direction::High => {
                Phase::HighExcursion
            }
            State::Excursion(_) => Phase::LowExcursion,
            State::Cooldown(_) => Phase::Cooldown,
        }
    }

    /// Excursions recorded by the open debounce window.
    pub fn samples(&self) -> &[u32] {
        match &self.state {
            State::Excursion(window) => &window.samples,
            _ => &[],
        }
    }

    /// Feeds a fresh household total power measurement (W, sign ignored).
    pub fn on_power_sample(&mut self, total_power: i32, limiter: &dyn RateLimiter) {
        if matches!(self.state, State::Cooldown(_)) {
            return;
        }

        let power = total_power.unsigned_abs();
        let upper = self.settings.upper_limit;
        let lower = self.settings.lower_limit;

        if power > upper {
            debug!("total power {}W exceeds {}W", power, upper);
            self.record(Direction::High, power - upper);
        } else if power < lower && limiter.current_limit() < self.settings.max_charge_power {
            debug!("total power {}W below {}W", power, lower);
            self.record(Direction::Low, lower - power);
        } else if let State::Excursion(window) = &self.state {
            info!(
                "total power {}W within range, dropping {} pending samples",
                power,
                window.samples.len()
            );
            self.reset();
        }
    }

    /// Routes an expired timer. Handles that do not belong to the current state are ignored.
    pub fn on_timer(&mut self, handle: TimerHandle, limiter: &mut dyn RateLimiter) {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Excursion(window) if window.timer == handle => {
                self.adjust(window, limiter);
            }
            State::Cooldown(timer) if timer == handle => {
                info!("cooldown period ended");
            }
            other => self.state = other,
        }
    }

    fn record(&mut self, direction: Direction, excursion: u32) {
        match &mut self.state {
            State::Excursion(window) if window.direction == direction => {
                window.samples.push(excursion);
            }
            _ => {
                self.reset();
                let timer = self.scheduler.after(self.settings.debounce_delay);
                self.state = State::Excursion(ExcursionWindow {
                    direction,
                    timer,
                    samples: vec![excursion],
                });
            }
        }
    }

    fn reset(&mut self) {
        if let State::Excursion(window) = &self.state {
            self.scheduler.cancel(window.timer);
        }
        self.state = State::Idle;
    }

    fn adjust(&mut self, window: ExcursionWindow, limiter: &mut dyn RateLimiter) {
        let delta = median(&window.samples);
        let current = limiter.current_limit();
        let new_limit = match window.direction {
            Direction::High => {
                let new_limit = current
                    .saturating_sub(delta)
                    .max(self.settings.min_charge_power);
                info!("reducing power by {}W to {}W", delta, new_limit);
                new_limit
            }
            Direction::Low => {
                let new_limit = current
                    .saturating_add(delta)
                    .min(self.settings.max_charge_power);
                info!("increasing power by {}W to {}W", delta, new_limit);
                new_limit
            }
        };
        limiter.set_limit(new_limit);

        info!("starting cooldown period");
        self.state = State::Cooldown(self.scheduler.after(self.settings.cooldown_period));
    }
}

/// Median of the samples, rounded to whole Watts. Zero when empty.
pub fn median(samples: &[u32]) -> u32 {
    if samples.is_empty() {
        return 0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        ((f64::from(sorted[mid - 1]) + f64::from(sorted[mid])) / 2.0).round() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;

    #[derive(Debug)]
    struct Limiter {
        limit: u32,
        calls: Vec<u32>,
    }

    impl Limiter {
        fn new(limit: u32) -> Self {
            Self {
                limit,
                calls: Vec::new(),
            }
        }
    }

    impl RateLimiter for Limiter {
        fn set_limit(&mut self, limit: u32) {
            self.limit = limit;
            self.calls.push(limit);
        }

        fn current_limit(&self) -> u32 {
            self.limit
        }
    }

    fn controller() -> RateController<ManualScheduler> {
        RateController::new(
            ControllerSettings {
                upper_limit: 5000,
                lower_limit: 4770,
                max_charge_power: 3000,
                min_charge_power: 1,
                debounce_delay: Duration::from_secs(10),
                cooldown_period: Duration::from_secs(15),
            },
            ManualScheduler::new(),
        )
    }

    fn fire(controller: &mut RateController<ManualScheduler>, by: u64, limiter: &mut Limiter) {
        for handle in controller.scheduler_mut().advance(Duration::from_secs(by)) {
            controller.on_timer(handle, limiter);
        }
    }

    #[test]
    fn median_of_odd_and_even() {
        assert_eq!(median(&[500, 400, 600]), 500);
        assert_eq!(median(&[3, 4]), 4);
        assert_eq!(median(&[10, 1, 1000, 2]), 6);
        assert_eq!(median(&[]), 0);
    }

    #[test]
    fn high_excursion_reduces_limit() {
        let mut controller = controller();
        let mut limiter = Limiter::new(2000);

        for sample in [5500, 5400, 5600] {
            controller.on_power_sample(sample, &limiter);
        }
        assert_eq!(controller.phase(), Phase::HighExcursion);
        assert_eq!(controller.samples(), &[500, 400, 600]);
        assert_eq!(controller.scheduler().armed(), 1);

        fire(&mut controller, 10, &mut limiter);

        assert_eq!(limiter.calls, vec![1500]);
        assert_eq!(controller.phase(), Phase::Cooldown);
    }

    #[test]
    fn negative_total_power_counts_as_magnitude() {
        let mut controller = controller();
        let mut limiter = Limiter::new(2000);

        controller.on_power_sample(-6000, &limiter);
        fire(&mut controller, 10, &mut limiter);

        assert_eq!(limiter.calls, vec![1000]);
    }

    #[test]
    fn reduction_stops_at_minimum() {
        let mut controller = controller();
        let mut limiter = Limiter::new(300);

        controller.on_power_sample(9000, &limiter);
        fire(&mut controller, 10, &mut limiter);

        assert_eq!(limiter.calls, vec![1]);
    }

    #[test]
    fn low_excursion_raises_limit_up_to_max() {
        let mut controller = controller();
        let mut limiter = Limiter::new(2000);

        controller.on_power_sample(4000, &limiter);
        controller.on_power_sample(4270, &limiter);
        assert_eq!(controller.phase(), Phase::LowExcursion);
        assert_eq!(controller.samples(), &[770, 500]);

        fire(&mut controller, 10, &mut limiter);
        assert_eq!(limiter.calls, vec![2635]);

        fire(&mut controller, 15, &mut limiter);
        assert_eq!(controller.phase(), Phase::Idle);

        controller.on_power_sample(0, &limiter);
        fire(&mut controller, 10, &mut limiter);
        assert_eq!(limiter.calls, vec![2635, 3000]);
        assert_eq!(
            limiter.current_limit(),
            controller.settings().max_charge_power
        );
    }

    #[test]
    fn no_increase_without_headroom() {
        let mut controller = controller();
        let limiter = Limiter::new(3000);

        controller.on_power_sample(100, &limiter);

        assert_eq!(controller.phase(), Phase::Idle);
        assert_eq!(controller.scheduler().armed(), 0);
    }

    #[test]
    fn cooldown_ignores_samples() {
        let mut controller = controller();
        let mut limiter = Limiter::new(2000);
        controller.on_power_sample(5500, &limiter);
        fire(&mut controller, 10, &mut limiter);

        controller.on_power_sample(6000, &limiter);

        assert_eq!(controller.phase(), Phase::Cooldown);
        assert!(controller.samples().is_empty());
        assert_eq!(controller.scheduler().armed(), 1);

        fire(&mut controller, 15, &mut limiter);
        assert_eq!(controller.phase(), Phase::Idle);
        assert_eq!(limiter.calls, vec![1500]);
    }

    #[test]
    fn band_reentry_discards_window() {
        let mut controller = controller();
        let mut limiter = Limiter::new(2000);

        controller.on_power_sample(5500, &limiter);
        controller.on_power_sample(5400, &limiter);
        controller.on_power_sample(4900, &limiter);

        assert_eq!(controller.phase(), Phase::Idle);
        assert_eq!(controller.scheduler().armed(), 0);

        fire(&mut controller, 30, &mut limiter);
        assert!(limiter.calls.is_empty());
    }

    #[test]
    fn direction_flip_restarts_window() {
        let mut controller = controller();
        let mut limiter = Limiter::new(2000);

        controller.on_power_sample(5500, &limiter);
        fire(&mut controller, 5, &mut limiter);
        controller.on_power_sample(4000, &limiter);

        assert_eq!(controller.phase(), Phase::LowExcursion);
        assert_eq!(controller.samples(), &[770]);
        assert_eq!(controller.scheduler().armed(), 1);

        // the high window's deadline passes without effect
        fire(&mut controller, 5, &mut limiter);
        assert!(limiter.calls.is_empty());

        fire(&mut controller, 5, &mut limiter);
        assert_eq!(limiter.calls, vec![2770]);
    }

    #[test]
    fn stale_timer_is_ignored() {
        let mut controller = controller();
        let mut limiter = Limiter::new(2000);

        controller.on_power_sample(5500, &limiter);
        let stale = controller.scheduler_mut().after(Duration::ZERO);
        controller.on_timer(stale, &mut limiter);

        assert_eq!(controller.phase(), Phase::HighExcursion);
        assert!(limiter.calls.is_empty());
    }
}
