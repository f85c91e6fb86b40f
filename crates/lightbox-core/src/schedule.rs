//! Flags shared between the scheduler, its preemption timer and the HTTP
//! control server.
//!
//! The task indicator has two writers (scheduler loop and timer); the run
//! flag too. Timer preemption always wins:
//! - the timer stores [`Duty::Update`] first, then clears the run flag;
//! - the scheduler sets the run flag, then re-reads the indicator and clears
//!   the flag again if the timer got in between.
//!
//! With sequentially consistent ordering either the scheduler observes the
//! timer's indicator write, or the timer's clear lands after the scheduler's
//! set. The server can never be left running past a preemption.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Duty performed by the control-plane context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duty {
    /// Run the HTTP control server.
    Serve,
    /// Refresh system data (location, clock, weather).
    Update,
}

impl Duty {
    fn as_u8(self) -> u8 {
        match self {
            Duty::Serve => 1,
            Duty::Update => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Duty::Serve,
            _ => Duty::Update,
        }
    }
}

/// Task indicator and server run flag.
#[derive(Debug)]
pub struct ControlFlags {
    duty: AtomicU8,
    run: AtomicBool,
}

impl ControlFlags {
    pub fn new(initial: Duty) -> Self {
        Self {
            duty: AtomicU8::new(initial.as_u8()),
            run: AtomicBool::new(false),
        }
    }

    pub fn duty(&self) -> Duty {
        Duty::from_u8(self.duty.load(Ordering::SeqCst))
    }

    /// Scheduler-side indicator write.
    pub fn set_duty(&self, duty: Duty) {
        self.duty.store(duty.as_u8(), Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }

    /// Arm the run flag for a serve cycle.
    ///
    /// Returns `false`, with the flag cleared, if the indicator is no longer
    /// [`Duty::Serve`] after arming.
    pub fn begin_serve(&self) -> bool {
        if self.duty() != Duty::Serve {
            return false;
        }
        self.run.store(true, Ordering::SeqCst);
        if self.duty() != Duty::Serve {
            self.run.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Arm the run flag unconditionally (single-purpose servers).
    pub fn start(&self) {
        self.run.store(true, Ordering::SeqCst);
    }

    /// Clear the run flag; returns whether it was set.
    pub fn stop(&self) -> bool {
        self.run
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Timer-side preemption: force [`Duty::Update`] and stop the server.
    pub fn preempt(&self) {
        self.duty.store(Duty::Update.as_u8(), Ordering::SeqCst);
        self.run.store(false, Ordering::SeqCst);
    }
}

impl Default for ControlFlags {
    fn default() -> Self {
        Self::new(Duty::Update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_serve_requires_serve_duty() {
        let flags = ControlFlags::new(Duty::Update);
        assert!(!flags.begin_serve());
        assert!(!flags.is_running());

        flags.set_duty(Duty::Serve);
        assert!(flags.begin_serve());
        assert!(flags.is_running());
    }

    #[test]
    fn test_preempt_wins_over_serve() {
        let flags = ControlFlags::new(Duty::Serve);
        assert!(flags.begin_serve());

        flags.preempt();

        assert_eq!(flags.duty(), Duty::Update);
        assert!(!flags.is_running());
        assert!(!flags.begin_serve());
    }

    #[test]
    fn test_stop_is_compare_and_clear() {
        let flags = ControlFlags::default();
        assert!(!flags.stop());
        flags.start();
        assert!(flags.stop());
        assert!(!flags.stop());
    }

    #[test]
    fn test_concurrent_preemption_never_leaves_server_running() {
        use std::sync::Arc;

        for _ in 0..200 {
            let flags = Arc::new(ControlFlags::new(Duty::Serve));
            let timer = {
                let flags = flags.clone();
                std::thread::spawn(move || flags.preempt())
            };
            let armed = flags.begin_serve();
            timer.join().unwrap();

            assert_eq!(flags.duty(), Duty::Update);
            assert!(!flags.is_running(), "armed={}", armed);
        }
    }
}
