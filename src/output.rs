use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Serializes the output of concurrently running tasks so that each
/// task's lines appear as one contiguous run on the shared sink.
///
/// Writers enter a FIFO when opened. At most one writer is active at a
/// time; its lines stream straight through to the sink. Everyone else
/// buffers until promoted, at which point the whole buffer is flushed at
/// once.
pub struct Console {
    state: Mutex<ConsoleState>,
    sink: Mutex<Box<dyn Write + Send>>,
}

struct ConsoleState {
    has_active: bool,
    queue: VecDeque<Arc<WriterInner>>,
}

struct WriterInner {
    name: String,
    state: Mutex<WriterState>,
}

struct WriterState {
    buffer: Vec<String>,
    active: bool,
    finished: bool,
}

impl Console {
    pub fn new(sink: Box<dyn Write + Send>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ConsoleState {
                has_active: false,
                queue: VecDeque::new(),
            }),
            sink: Mutex::new(sink),
        })
    }

    pub fn stdout() -> Arc<Self> {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Open a writer for the named task and put it in line for the sink.
    /// If nothing is active it goes live immediately.
    pub fn open(self: &Arc<Self>, name: impl Into<String>) -> CohesiveWriter {
        let name = name.into();
        let inner = Arc::new(WriterInner {
            state: Mutex::new(WriterState {
                buffer: vec![format!(">>> Begin output from: {name}\n")],
                active: false,
                finished: false,
            }),
            name,
        });
        let mut state = self.state.lock().expect("console state lock");
        state.queue.push_back(Arc::clone(&inner));
        if !state.has_active {
            self.promote_next(&mut state);
        }
        drop(state);
        CohesiveWriter {
            console: Arc::clone(self),
            inner,
        }
    }

    /// Write one line straight to the sink, skipping the writer queue.
    /// Only used when no cohesive writers are open (dry runs).
    pub fn print_line(&self, line: &str) {
        let mut sink = self.sink.lock().expect("console sink lock");
        let _ = writeln!(sink, "{line}");
        let _ = sink.flush();
    }

    /// Pop queued writers, flushing each one's buffer, until one is found
    /// that hasn't finished yet; that one becomes the active writer.
    fn promote_next(&self, state: &mut ConsoleState) {
        while let Some(next) = state.queue.pop_front() {
            let mut writer = next.state.lock().expect("writer state lock");
            {
                let mut sink = self.sink.lock().expect("console sink lock");
                for line in writer.buffer.drain(..) {
                    let _ = sink.write_all(line.as_bytes());
                }
                let _ = sink.flush();
            }
            if !writer.finished {
                writer.active = true;
                state.has_active = true;
                return;
            }
            // Already finished, everything it had is flushed; keep going
        }
        state.has_active = false;
    }
}

/// A per-task output channel. The task's lines, bracketed by a begin and
/// an end marker, come out of the console as one contiguous run no matter
/// how its writes interleave with other tasks.
pub struct CohesiveWriter {
    console: Arc<Console>,
    inner: Arc<WriterInner>,
}

impl CohesiveWriter {
    /// Emit one line (without trailing newline) of task output.
    pub fn write_line(&self, line: &str) {
        let mut writer = self.inner.state.lock().expect("writer state lock");
        if writer.active {
            let mut sink = self.console.sink.lock().expect("console sink lock");
            let _ = writeln!(sink, "{line}");
            let _ = sink.flush();
        } else {
            writer.buffer.push(format!("{line}\n"));
        }
    }

    /// Mark the writer finished and hand the sink to the next one in
    /// line. Closing twice is a no-op.
    pub fn close(&self) {
        let mut state = self.console.state.lock().expect("console state lock");
        let mut writer = self.inner.state.lock().expect("writer state lock");
        if writer.finished {
            return;
        }
        writer.finished = true;
        let trailer = format!("<<< End output from: {}\n", self.inner.name);
        if writer.active {
            writer.active = false;
            {
                let mut sink = self.console.sink.lock().expect("console sink lock");
                let _ = sink.write_all(trailer.as_bytes());
                let _ = sink.flush();
            }
            drop(writer);
            state.has_active = false;
            self.console.promote_next(&mut state);
        } else {
            // Still queued; the trailer flushes with the buffer when this
            // writer's turn comes
            writer.buffer.push(trailer);
        }
    }
}

impl Drop for CohesiveWriter {
    fn drop(&mut self) {
        self.close();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::SharedSink;
    use super::*;

    fn console_with_sink() -> (Arc<Console>, SharedSink) {
        let sink = SharedSink::default();
        (Console::new(Box::new(sink.clone())), sink)
    }

    /// Walk the output and assert every writer's begin marker, lines, and
    /// end marker form a contiguous run.
    fn assert_cohesive(output: &str) {
        let mut current: Option<String> = None;
        for line in output.lines() {
            match &current {
                None => {
                    let name = line
                        .strip_prefix(">>> Begin output from: ")
                        .unwrap_or_else(|| panic!("expected a begin marker, got '{line}'"));
                    current = Some(name.to_string());
                }
                Some(name) => {
                    if let Some(ended) = line.strip_prefix("<<< End output from: ") {
                        assert_eq!(ended, name, "end marker for the wrong writer");
                        current = None;
                    } else {
                        assert!(
                            line.starts_with(&format!("{name}: ")),
                            "line '{line}' interleaved into output of '{name}'"
                        );
                    }
                }
            }
        }
        assert_eq!(current, None, "unterminated writer output");
    }

    #[test]
    fn test_open_close() {
        let (console, sink) = console_with_sink();
        let writer = console.open("foobar");
        writer.close();
        assert_eq!(
            sink.contents(),
            ">>> Begin output from: foobar\n<<< End output from: foobar\n"
        );
    }

    #[test]
    fn test_one_writer() {
        let (console, sink) = console_with_sink();
        let writer = console.open("foobar");
        writer.write_line("Hello world!");
        writer.close();
        assert_eq!(
            sink.contents(),
            ">>> Begin output from: foobar\nHello world!\n<<< End output from: foobar\n"
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let (console, sink) = console_with_sink();
        let writer = console.open("foobar");
        writer.close();
        writer.close();
        drop(writer);
        assert_eq!(
            sink.contents(),
            ">>> Begin output from: foobar\n<<< End output from: foobar\n"
        );
    }

    #[test]
    fn test_nested_writers() {
        let (console, sink) = console_with_sink();
        let one = console.open("co1");
        one.write_line("co1: foo");
        let two = console.open("co2");
        two.write_line("co2: foo");
        one.write_line("co1: bar");
        two.write_line("co2: bar");
        two.close();
        one.write_line("co1: baz");
        one.close();

        let expected = "\
>>> Begin output from: co1
co1: foo
co1: bar
co1: baz
<<< End output from: co1
>>> Begin output from: co2
co2: foo
co2: bar
<<< End output from: co2
";
        assert_eq!(sink.contents(), expected);
    }

    #[test]
    fn test_queued_writer_finishing_early_is_skipped() {
        let (console, sink) = console_with_sink();
        let first = console.open("co1");
        let second = console.open("co2");
        let third = console.open("co3");

        // co2 and co3 finish while co1 is still active
        second.write_line("co2: only");
        second.close();
        third.close();
        first.write_line("co1: only");
        first.close();

        let expected = "\
>>> Begin output from: co1
co1: only
<<< End output from: co1
>>> Begin output from: co2
co2: only
<<< End output from: co2
>>> Begin output from: co3
<<< End output from: co3
";
        assert_eq!(sink.contents(), expected);
    }

    #[test]
    fn test_many_writers_round_robin() {
        let (console, sink) = console_with_sink();
        let writers: Vec<CohesiveWriter> =
            (0..100).map(|i| console.open(format!("co{i}"))).collect();

        // Interleave writes across every open writer
        for message in 0..(writers.len() * 10) {
            let i = (message * 7) % writers.len();
            writers[i].write_line(&format!("co{i}: {message}"));
        }
        for writer in &writers {
            writer.close();
        }

        let output = sink.contents();
        assert_cohesive(&output);
        // FIFO order: writers went live in open order
        let begins: Vec<&str> = output
            .lines()
            .filter(|line| line.starts_with(">>> Begin"))
            .collect();
        assert_eq!(begins.len(), 100);
        assert_eq!(begins[0], ">>> Begin output from: co0");
        assert_eq!(begins[99], ">>> Begin output from: co99");
    }

    #[test]
    fn test_concurrent_writers_stay_contiguous() {
        let (console, sink) = console_with_sink();

        std::thread::scope(|scope| {
            for i in 0..16 {
                let console = Arc::clone(&console);
                scope.spawn(move || {
                    let name = format!("co{i}");
                    let writer = console.open(name.clone());
                    for line in 0..10 {
                        writer.write_line(&format!("{name}: line {line}"));
                        std::thread::yield_now();
                    }
                    writer.close();
                });
            }
        });

        assert_cohesive(&sink.contents());
    }
}
