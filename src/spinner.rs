use std::io::{self, IsTerminal, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossterm::cursor::MoveToColumn;
use crossterm::style::Print;
use crossterm::terminal::{Clear, ClearType};
use crossterm::{execute, queue};

const FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const TICK: Duration = Duration::from_millis(80);

/// One-line status indicator redrawn from a single helper thread.
///
/// Does nothing but print the final line when stdout is not a terminal.
pub struct Spinner {
    message: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Spinner {
    pub fn start(message: impl Into<String>) -> Self {
        let message = message.into();
        let running = Arc::new(AtomicBool::new(true));

        let handle = io::stdout().is_terminal().then(|| {
            let running = Arc::clone(&running);
            let message = message.clone();
            thread::spawn(move || {
                let mut out = io::stdout();
                let mut tick = 0;
                while running.load(Ordering::Relaxed) {
                    let _ = queue!(
                        out,
                        MoveToColumn(0),
                        Clear(ClearType::CurrentLine),
                        Print(format!("{} {message}", frame(tick)))
                    );
                    let _ = out.flush();
                    tick += 1;
                    thread::sleep(TICK);
                }
            })
        });

        Self {
            message,
            running,
            handle,
        }
    }

    /// Joins the redraw thread, then prints `✓` or `✗` with the message.
    pub fn stop(mut self, success: bool) {
        self.halt();
        let mark = if success { "✓" } else { "✗" };
        println!("{mark} {}", self.message);
    }

    fn halt(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            let _ = execute!(io::stdout(), MoveToColumn(0), Clear(ClearType::CurrentLine));
        }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.halt();
    }
}

fn frame(tick: usize) -> &'static str {
    FRAMES[tick % FRAMES.len()]
}
