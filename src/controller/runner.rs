//! Thread runner for a controller's cooperative task.
//!
//! One dedicated thread per controller: it opens the controller, steps the
//! task while work is pending, and parks otherwise until a lifecycle
//! command, a commit-position signal, or the snapshot timer wakes it.
//! Commands and signals are served between steps only, so the task stays
//! strictly serial.

use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{Receiver, Sender, select, unbounded};

use super::{StepOutcome, StreamProcessorController};

enum Command {
    Suspend,
    Resume,
    Close,
}

/// Handle to a controller running on its own thread.
///
/// Dropping the handle closes the controller and joins the thread.
pub struct ControllerHandle {
    commands: Sender<Command>,
    thread: Option<JoinHandle<StreamProcessorController>>,
}

/// Spawn `controller` on a dedicated thread and open it.
pub fn spawn(controller: StreamProcessorController) -> ControllerHandle {
    let (commands, command_rx) = unbounded();
    let thread = thread::spawn(move || run(controller, command_rx));
    ControllerHandle {
        commands,
        thread: Some(thread),
    }
}

impl ControllerHandle {
    pub fn suspend(&self) {
        let _ = self.commands.send(Command::Suspend);
    }

    pub fn resume(&self) {
        let _ = self.commands.send(Command::Resume);
    }

    /// Close the controller and join its thread, returning the controller
    /// for inspection.
    pub fn close(mut self) -> StreamProcessorController {
        let _ = self.commands.send(Command::Close);
        self.thread
            .take()
            .expect("controller thread already joined")
            .join()
            .expect("controller thread panicked")
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.commands.send(Command::Close);
            let _ = thread.join();
        }
    }
}

fn run(
    mut controller: StreamProcessorController,
    commands: Receiver<Command>,
) -> StreamProcessorController {
    controller.open();

    let signals = controller.commit_signals();
    let period = controller.snapshot_period();
    let mut next_snapshot = Instant::now() + period;

    loop {
        // Serve lifecycle commands between steps.
        loop {
            match commands.try_recv() {
                Ok(Command::Suspend) => controller.suspend(),
                Ok(Command::Resume) => controller.resume(),
                Ok(Command::Close) => {
                    controller.close();
                    return controller;
                }
                Err(_) => break,
            }
        }

        if Instant::now() >= next_snapshot {
            controller.snapshot_tick();
            next_snapshot = Instant::now() + period;
        }

        match controller.step() {
            StepOutcome::Progress => {}
            StepOutcome::Yielded => thread::yield_now(),
            StepOutcome::Idle => {
                let timeout = next_snapshot.saturating_duration_since(Instant::now());
                select! {
                    recv(commands) -> command => match command {
                        Ok(Command::Suspend) => controller.suspend(),
                        Ok(Command::Resume) => controller.resume(),
                        Ok(Command::Close) | Err(_) => {
                            controller.close();
                            return controller;
                        }
                    },
                    recv(signals) -> signal => {
                        if signal.is_ok() {
                            controller.on_commit_position_updated();
                        }
                    }
                    default(timeout) => {}
                }
            }
        }
    }
}
