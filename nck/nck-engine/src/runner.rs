//! The simulation thread.
//!
//! Owns a [`Simulation`] on a dedicated thread: while paused it sleeps on a
//! condition variable; while running it loops drain-integrate-publish with
//! a minimum tick interval. A peer that queues save/load I/O against a
//! paused engine wakes it for exactly one step: the wake sets a
//! pause-after-io flag that the loop consumes at its top, so the engine
//! performs the queued I/O and then goes back to sleep on its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::info;

use crate::sim::Simulation;

/// Minimum wall-clock interval between steps.
const MIN_TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct PauseFlags {
    paused: bool,
    pause_after_io: bool,
}

#[derive(Debug)]
struct RunnerControl {
    pause: Mutex<PauseFlags>,
    wake: Condvar,
    keep_running: AtomicBool,
}

/// Handle to the simulation thread.
///
/// The thread starts paused; the server unpauses it when the first client
/// connects and pauses it again when the last one leaves.
pub struct SimulationRunner {
    control: Arc<RunnerControl>,
    thread: Option<JoinHandle<Simulation>>,
}

impl SimulationRunner {
    /// Move the simulation onto a new thread, initially paused.
    #[must_use]
    pub fn spawn(sim: Simulation) -> Self {
        let control = Arc::new(RunnerControl {
            pause: Mutex::new(PauseFlags {
                paused: true,
                pause_after_io: false,
            }),
            wake: Condvar::new(),
            keep_running: AtomicBool::new(true),
        });
        let thread_control = Arc::clone(&control);
        let thread = thread::Builder::new()
            .name("simulation".into())
            .spawn(move || run(sim, &thread_control))
            .expect("failed to spawn simulation thread");
        Self {
            control,
            thread: Some(thread),
        }
    }

    /// Resume continuous stepping.
    pub fn unpause(&self) {
        info!("unpausing simulation thread");
        let mut flags = self.control.pause.lock().expect("pause lock poisoned");
        flags.paused = false;
        flags.pause_after_io = false;
        drop(flags);
        self.control.wake.notify_all();
    }

    /// Pause at the top of the next loop iteration.
    pub fn pause(&self) {
        info!("pausing simulation thread");
        let mut flags = self.control.pause.lock().expect("pause lock poisoned");
        flags.paused = true;
    }

    /// If paused, wake for one step so queued I/O can run, then re-pause.
    pub fn wake_for_io(&self) {
        let mut flags = self.control.pause.lock().expect("pause lock poisoned");
        if flags.paused {
            flags.paused = false;
            flags.pause_after_io = true;
            drop(flags);
            self.control.wake.notify_all();
        }
    }

    /// Whether the thread is currently flagged as paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.control.pause.lock().expect("pause lock poisoned").paused
    }

    /// Stop the thread and recover the simulation.
    #[must_use]
    pub fn shutdown(mut self) -> Simulation {
        self.signal_shutdown();
        self.thread
            .take()
            .expect("simulation thread already joined")
            .join()
            .expect("simulation thread panicked")
    }

    fn signal_shutdown(&self) {
        self.control.keep_running.store(false, Ordering::Relaxed);
        let mut flags = self.control.pause.lock().expect("pause lock poisoned");
        flags.paused = false;
        drop(flags);
        self.control.wake.notify_all();
    }
}

impl Drop for SimulationRunner {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.signal_shutdown();
            let _ = thread.join();
        }
    }
}

fn run(mut sim: Simulation, control: &RunnerControl) -> Simulation {
    let mut last = Instant::now();
    loop {
        {
            let mut flags = control.pause.lock().expect("pause lock poisoned");
            // A wake-for-io wake lasts one iteration.
            if flags.pause_after_io {
                flags.paused = true;
                flags.pause_after_io = false;
            }
            while flags.paused && control.keep_running.load(Ordering::Relaxed) {
                flags = control.wake.wait(flags).expect("pause lock poisoned");
                // Do not integrate across the time spent asleep.
                last = Instant::now();
            }
        }
        if !control.keep_running.load(Ordering::Relaxed) {
            break;
        }

        let now = Instant::now();
        let time_step = now.duration_since(last).as_secs_f32();
        last = now;
        sim.advance(time_step);

        let elapsed = last.elapsed();
        if elapsed < MIN_TICK {
            thread::sleep(MIN_TICK - elapsed);
        }
    }
    sim
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[test]
    fn starts_paused_and_steps_when_unpaused() {
        let (sim, handle) = Simulation::new(&EngineConfig::default());
        let mut reader = handle.state_reader();
        reader.lock_newest();
        let initial = reader.locked().unwrap().time_stamp;

        let runner = SimulationRunner::spawn(sim);
        assert!(runner.is_paused());
        thread::sleep(Duration::from_millis(20));
        reader.lock_newest();
        assert_eq!(reader.locked().unwrap().time_stamp, initial);

        runner.unpause();
        thread::sleep(Duration::from_millis(50));
        assert!(reader.lock_newest());
        assert!(reader.locked().unwrap().time_stamp > initial);

        let sim = runner.shutdown();
        assert_eq!(sim.num_units(), 0);
    }

    #[test]
    fn wake_for_io_runs_one_step_then_repauses() {
        let (sim, handle) = Simulation::new(&EngineConfig::default());
        let runner = SimulationRunner::spawn(sim);

        let mut reader = handle.state_reader();
        reader.lock_newest();
        let before = reader.locked().unwrap().time_stamp;

        runner.wake_for_io();
        thread::sleep(Duration::from_millis(50));

        assert!(runner.is_paused());
        reader.lock_newest();
        let after = reader.locked().unwrap().time_stamp;
        assert!(after > before, "the wake must have produced a step");

        thread::sleep(Duration::from_millis(30));
        reader.lock_newest();
        assert_eq!(
            reader.locked().unwrap().time_stamp,
            after,
            "no further steps after re-pausing"
        );
    }
}
