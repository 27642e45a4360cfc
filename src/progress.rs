use clap::ValueEnum;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MAX_STORED_WARNINGS: usize = 32;
const TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ProgressMode {
    Auto,
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedProgressMode {
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    pub mode: ProgressMode,
    pub idle_threshold: Duration,
    pub plain_interval: Duration,
    tty_override: Option<bool>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            mode: ProgressMode::Auto,
            idle_threshold: Duration::from_secs(30),
            plain_interval: Duration::from_secs(2),
            tty_override: None,
        }
    }
}

impl ProgressConfig {
    pub fn new(mode: ProgressMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn with_tty_override(mut self, is_tty: bool) -> Self {
        self.tty_override = Some(is_tty);
        self
    }

    pub fn resolve_mode(self) -> ResolvedProgressMode {
        let is_tty = self
            .tty_override
            .unwrap_or_else(|| std::io::stderr().is_terminal());
        match self.mode {
            ProgressMode::Auto if is_tty => ResolvedProgressMode::Rich,
            ProgressMode::Auto | ProgressMode::Plain => ResolvedProgressMode::Plain,
            ProgressMode::Rich => ResolvedProgressMode::Rich,
            ProgressMode::Quiet => ResolvedProgressMode::Quiet,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

pub trait Notify: Send + Sync {
    fn notify(&self, level: Level, message: &str);

    fn info(&self, message: &str) {
        self.notify(Level::Info, message);
    }

    fn warn(&self, message: &str) {
        self.notify(Level::Warn, message);
    }

    fn error(&self, message: &str) {
        self.notify(Level::Error, message);
    }
}

#[derive(Debug, Clone)]
pub struct BrowseSummary {
    pub output_dir: PathBuf,
    pub descriptor_count: usize,
    pub visited_frames: u64,
    pub written_frames: usize,
    pub failed_frames: usize,
    pub failed_files: usize,
    pub decode_workers: usize,
    pub elapsed: Duration,
    pub avg_frames_per_sec: f64,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressOutcome {
    pub elapsed: Duration,
    pub frames_done: u64,
    pub avg_frames_per_sec: f64,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
struct Snapshot {
    stage: String,
    current: Option<String>,
    done: u64,
    total: u64,
    elapsed: Duration,
    rate: f64,
    eta: Option<Duration>,
}

#[derive(Debug)]
struct State {
    started: Instant,
    stage: String,
    current: Option<String>,
    done: u64,
    total: u64,
    last_progress: Instant,
    last_plain_emit: Option<Instant>,
    last_idle_warn: Option<Instant>,
    warnings: Vec<String>,
}

impl State {
    fn snapshot(&self) -> Snapshot {
        let elapsed = self.started.elapsed();
        let rate = average_rate(self.done, elapsed);
        Snapshot {
            stage: self.stage.clone(),
            current: self.current.clone(),
            done: self.done,
            total: self.total,
            elapsed,
            rate,
            eta: compute_eta(self.total, self.done, rate),
        }
    }

    fn retain_warning(&mut self, message: &str) {
        if self.warnings.len() >= MAX_STORED_WARNINGS {
            self.warnings.remove(0);
        }
        self.warnings.push(message.to_string());
    }
}

struct Bars {
    _multi: MultiProgress,
    frames: ProgressBar,
    status: ProgressBar,
}

struct Shared {
    label: String,
    mode: ResolvedProgressMode,
    idle_threshold: Duration,
    plain_interval: Duration,
    state: Mutex<State>,
    bars: Option<Bars>,
    stop: AtomicBool,
    finalized: AtomicBool,
}

#[derive(Clone)]
pub struct ProgressHandle {
    shared: Arc<Shared>,
}

pub struct ProgressReporter {
    handle: ProgressHandle,
    ticker: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn new(label: impl Into<String>, total_frames: u64, config: ProgressConfig) -> Self {
        let label = label.into();
        let mode = config.resolve_mode();
        let now = Instant::now();
        let bars = (mode == ResolvedProgressMode::Rich).then(|| Bars::new(&label, total_frames));

        let shared = Arc::new(Shared {
            label,
            mode,
            idle_threshold: config.idle_threshold,
            plain_interval: config.plain_interval,
            state: Mutex::new(State {
                started: now,
                stage: "starting".to_string(),
                current: None,
                done: 0,
                total: total_frames,
                last_progress: now,
                last_plain_emit: None,
                last_idle_warn: None,
                warnings: Vec::new(),
            }),
            bars,
            stop: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
        });

        let ticker = (mode != ResolvedProgressMode::Quiet).then(|| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                while !shared.stop.load(Ordering::Relaxed) {
                    thread::sleep(TICK);
                    shared.tick();
                }
            })
        });

        Self {
            handle: ProgressHandle { shared },
            ticker,
        }
    }

    pub fn handle(&self) -> ProgressHandle {
        self.handle.clone()
    }

    pub fn finish(mut self, final_message: impl Into<String>) -> ProgressOutcome {
        self.stop_ticker();
        self.handle.shared.finalize(Some(final_message.into()))
    }

    fn stop_ticker(&mut self) {
        self.handle.shared.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.ticker.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop_ticker();
        let _ = self.handle.shared.finalize(None);
    }
}

impl ProgressHandle {
    pub fn set_total(&self, total_frames: u64) {
        let snapshot = self.update(|state| state.total = total_frames);
        self.shared.render(&snapshot, true);
    }

    pub fn set_stage(&self, stage: impl Into<String>) {
        let stage = stage.into();
        let snapshot = self.update(|state| state.stage = stage);
        self.shared.render(&snapshot, true);
    }

    pub fn set_current(&self, item: Option<String>) {
        let snapshot = self.update(|state| state.current = item);
        self.shared.render(&snapshot, false);
    }

    pub fn inc(&self, frames: u64) {
        if frames == 0 {
            return;
        }
        let snapshot = self.update(|state| {
            state.done = state.done.saturating_add(frames);
            if state.total > 0 {
                state.done = state.done.min(state.total);
            }
            state.last_progress = Instant::now();
        });
        self.shared.render(&snapshot, false);
    }

    pub fn log(&self, message: impl Into<String>) {
        self.shared.emit(Level::Info, &message.into());
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.notify(Level::Warn, &message.into());
    }

    fn update(&self, apply: impl FnOnce(&mut State)) -> Snapshot {
        let mut state = self.shared.state.lock().unwrap();
        apply(&mut *state);
        state.snapshot()
    }
}

impl Notify for ProgressHandle {
    fn notify(&self, level: Level, message: &str) {
        if level != Level::Info {
            self.shared.state.lock().unwrap().retain_warning(message);
        }
        self.shared.emit(level, message);
    }
}

impl Shared {
    fn tick(&self) {
        let (snapshot, plain_due, idle) = {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();

            let plain_due = state
                .last_plain_emit
                .map_or(true, |t| now.duration_since(t) >= self.plain_interval);
            if plain_due {
                state.last_plain_emit = Some(now);
            }

            let idle = if idle_warning_due(
                now,
                state.last_progress,
                state.last_idle_warn,
                self.idle_threshold,
                state.done,
                state.total,
            ) {
                state.last_idle_warn = Some(now);
                let msg = format!(
                    "no frame finished for {}s (stage={}, current={})",
                    now.duration_since(state.last_progress).as_secs(),
                    state.stage,
                    state.current.as_deref().unwrap_or("-")
                );
                state.retain_warning(&msg);
                Some(msg)
            } else {
                None
            };
            (state.snapshot(), plain_due, idle)
        };

        self.render(&snapshot, plain_due);
        if let Some(msg) = idle {
            self.emit(Level::Warn, &msg);
        }
    }

    fn render(&self, snapshot: &Snapshot, plain_due: bool) {
        match self.mode {
            ResolvedProgressMode::Rich => {
                if let Some(bars) = &self.bars {
                    bars.draw(snapshot);
                }
            }
            ResolvedProgressMode::Plain if plain_due => self.print_plain(snapshot),
            ResolvedProgressMode::Plain | ResolvedProgressMode::Quiet => {}
        }
    }

    fn print_plain(&self, s: &Snapshot) {
        eprintln!(
            "[PROGRESS] {} elapsed={} stage={} frames={}/{} rate={} ETA={} current={}",
            self.label,
            crate::util::fmt_duration(s.elapsed),
            s.stage,
            s.done,
            s.total,
            format_rate(s.rate),
            format_eta(s.eta),
            s.current.as_deref().unwrap_or("-")
        );
    }

    fn emit(&self, level: Level, message: &str) {
        let line = format!("[{}] {}: {}", level.tag(), self.label, message);
        match (self.mode, &self.bars) {
            (ResolvedProgressMode::Quiet, _) => {}
            (ResolvedProgressMode::Rich, Some(bars)) => bars.status.println(line),
            _ => eprintln!("{}", line),
        }
    }

    fn finalize(&self, final_message: Option<String>) -> ProgressOutcome {
        let (snapshot, warnings) = {
            let state = self.state.lock().unwrap();
            (state.snapshot(), state.warnings.clone())
        };

        if !self.finalized.swap(true, Ordering::Relaxed) {
            match self.mode {
                ResolvedProgressMode::Quiet => {}
                ResolvedProgressMode::Plain => {
                    self.print_plain(&snapshot);
                    if let Some(msg) = &final_message {
                        eprintln!("[DONE] {}: {}", self.label, msg);
                    }
                }
                ResolvedProgressMode::Rich => {
                    if let Some(bars) = &self.bars {
                        bars.finish(&snapshot, final_message);
                    }
                }
            }
        }

        ProgressOutcome {
            elapsed: snapshot.elapsed,
            frames_done: snapshot.done,
            avg_frames_per_sec: snapshot.rate,
            warning_count: warnings.len(),
            warnings,
        }
    }
}

impl Bars {
    fn new(label: &str, total_frames: u64) -> Self {
        let multi = MultiProgress::new();
        let frames = multi.add(ProgressBar::new(total_frames.max(1)));
        let status = multi.add(ProgressBar::new_spinner());

        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {wide_bar:.cyan/blue} {pos}/{len} frames | {msg}",
        ) {
            frames.set_style(style);
        }
        if let Ok(style) = ProgressStyle::with_template("{spinner:.yellow} {prefix:.bold} {msg}") {
            status.set_style(style.tick_chars("|/-\\ "));
        }
        status.set_prefix(label.to_string());
        status.enable_steady_tick(Duration::from_millis(120));

        Self {
            _multi: multi,
            frames,
            status,
        }
    }

    fn draw(&self, s: &Snapshot) {
        self.frames.set_length(s.total.max(1));
        self.frames.set_position(s.done.min(s.total.max(1)));
        self.frames
            .set_message(format!("rate={} ETA={}", format_rate(s.rate), format_eta(s.eta)));
        self.status.set_message(match &s.current {
            Some(item) => format!("{} | {}", s.stage, item),
            None => s.stage.clone(),
        });
    }

    fn finish(&self, s: &Snapshot, final_message: Option<String>) {
        self.frames.finish_with_message(format!(
            "frames={}/{} elapsed={} rate={}",
            s.done,
            s.total,
            crate::util::fmt_duration(s.elapsed),
            format_rate(s.rate)
        ));
        match final_message {
            Some(msg) => self.status.finish_with_message(msg),
            None => self.status.finish_and_clear(),
        }
    }
}

fn average_rate(frames: u64, elapsed: Duration) -> f64 {
    frames as f64 / elapsed.as_secs_f64().max(1e-6)
}

pub fn format_rate(per_sec: f64) -> String {
    if per_sec <= 0.01 {
        "0 fr/s".to_string()
    } else {
        format!("{:.1} fr/s", per_sec)
    }
}

fn format_eta(eta: Option<Duration>) -> String {
    eta.map(crate::util::fmt_duration)
        .unwrap_or_else(|| "--:--".to_string())
}

fn compute_eta(total: u64, done: u64, per_sec: f64) -> Option<Duration> {
    if per_sec <= 0.01 || done >= total {
        return None;
    }
    let remaining = (total - done) as f64;
    Some(Duration::from_secs_f64(remaining / per_sec))
}

fn idle_warning_due(
    now: Instant,
    last_progress: Instant,
    last_idle_warn: Option<Instant>,
    idle_threshold: Duration,
    done: u64,
    total: u64,
) -> bool {
    if total > 0 && done >= total {
        return false;
    }
    if now.duration_since(last_progress) < idle_threshold {
        return false;
    }
    last_idle_warn.map_or(true, |t| now.duration_since(t) >= idle_threshold)
}

#[cfg(test)]
#[derive(Default)]
pub struct MemorySink {
    pub entries: Mutex<Vec<(Level, String)>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn messages(&self, level: Level) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[cfg(test)]
impl Notify for MemorySink {
    fn notify(&self, level: Level, message: &str) {
        self.entries.lock().unwrap().push((level, message.to_string()));
    }
}
