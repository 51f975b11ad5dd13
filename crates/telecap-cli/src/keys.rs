//! Single-keystroke operator controls.
//!
//! `n` saves the episode and starts the next, `p` proceeds after an
//! environment reset, `e` ends the session, Ctrl-C cancels with
//! escalation. Raw mode means Ctrl-C arrives as a key event rather than
//! SIGINT while the terminal is ours.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossterm::event::{Event, KeyCode, KeyModifiers};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKey {
    SaveAndNext,
    Proceed,
    /// Discard the in-progress buffer and keep recording.
    Abort,
    Exit,
    Cancel,
}

pub struct KeyListener {
    pub rx: mpsc::UnboundedReceiver<ControlKey>,
    stop: Arc<AtomicBool>,
    raw_mode: bool,
}

impl KeyListener {
    /// Spawns the blocking key reader. When no TTY is attached (headless
    /// runs, tests) raw mode is skipped and the channel simply stays quiet.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let raw_mode = crossterm::terminal::enable_raw_mode().is_ok();
        if !raw_mode {
            debug!("no tty; keyboard controls disabled");
        }

        let stop_flag = stop.clone();
        std::thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                match crossterm::event::poll(Duration::from_millis(100)) {
                    Ok(true) => match crossterm::event::read() {
                        Ok(Event::Key(key)) => {
                            let mapped = match key.code {
                                KeyCode::Char('n') | KeyCode::Char('N') => {
                                    Some(ControlKey::SaveAndNext)
                                }
                                KeyCode::Char('p') | KeyCode::Char('P') => {
                                    Some(ControlKey::Proceed)
                                }
                                KeyCode::Char('a') | KeyCode::Char('A') => {
                                    Some(ControlKey::Abort)
                                }
                                KeyCode::Char('e') | KeyCode::Char('E') => Some(ControlKey::Exit),
                                KeyCode::Char('c')
                                    if key.modifiers.contains(KeyModifiers::CONTROL) =>
                                {
                                    Some(ControlKey::Cancel)
                                }
                                _ => None,
                            };
                            if let Some(key) = mapped {
                                if tx.send(key).is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(_) => return,
                    },
                    Ok(false) => {}
                    Err(_) => return,
                }
            }
        });

        Self { rx, stop, raw_mode }
    }
}

impl Drop for KeyListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.raw_mode {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}
