use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use walkdir::WalkDir;

const SOURCE_EXT: &str = "asm";
const ARTIFACT_EXT: &str = "gb";

#[derive(Parser, Debug)]
#[command(author, version, about = "yagbc2a golden-file test harness", long_about = None)]
struct Cli {
    /// Interpreter used to launch the compiler (looked up on PATH)
    #[arg(long, default_value = "java")]
    interpreter: String,
    /// Classpath holding the compiled compiler
    #[arg(long, default_value = "bin")]
    classpath: PathBuf,
    /// Fully qualified entrypoint class of the compiler
    #[arg(long, default_value = "open_source.amuyal_tal.yagbc2a.Main")]
    entrypoint: String,
    /// Directory holding the `.asm` fixture sources
    #[arg(long, default_value = "tests")]
    fixtures_dir: PathBuf,
    /// Directory generated artifacts are written into
    #[arg(long, default_value = "bin")]
    output_dir: PathBuf,
    /// Directory holding the golden `.gb` expectations
    #[arg(long, default_value = "tests")]
    expectation_dir: PathBuf,
    /// Per-fixture compile deadline in seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let harness = Harness::new(cli)?;
    let summary = harness.run_suite()?;
    print_report(&summary);
    if summary.error_count() > 0 {
        bail!("{}/{} fixtures failed", summary.error_count(), summary.total());
    }
    Ok(())
}

// --------------------- Shared harness --------------------------------------

struct Harness {
    interpreter: PathBuf,
    classpath: PathBuf,
    entrypoint: String,
    fixtures_dir: PathBuf,
    output_dir: PathBuf,
    expectation_dir: PathBuf,
    timeout: Duration,
}

impl Harness {
    fn new(cli: Cli) -> Result<Self> {
        let interpreter = which::which(&cli.interpreter)
            .with_context(|| format!("interpreter `{}` not found", cli.interpreter))?;
        if !cli.fixtures_dir.is_dir() {
            bail!(
                "fixtures directory `{}` does not exist",
                cli.fixtures_dir.display()
            );
        }
        fs::create_dir_all(&cli.output_dir).with_context(|| {
            format!("creating output directory `{}`", cli.output_dir.display())
        })?;

        Ok(Self {
            interpreter,
            classpath: cli.classpath,
            entrypoint: cli.entrypoint,
            fixtures_dir: cli.fixtures_dir,
            output_dir: cli.output_dir,
            expectation_dir: cli.expectation_dir,
            timeout: Duration::from_secs(cli.timeout_secs),
        })
    }

    fn run_suite(&self) -> Result<RunSummary> {
        // Leftovers from a previous run must be gone before any fixture is
        // attempted, or a dead compiler could still "pass".
        self.clean_output_dir()?;
        let fixtures = self.discover()?;
        let mut ledger = RunLedger::new();
        for fixture in &fixtures {
            ledger.record(self.run_fixture(fixture));
        }
        Ok(ledger.finish())
    }

    fn clean_output_dir(&self) -> Result<()> {
        for entry in fs::read_dir(&self.output_dir).with_context(|| {
            format!("listing output directory `{}`", self.output_dir.display())
        })? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ARTIFACT_EXT) {
                fs::remove_file(&path)
                    .with_context(|| format!("removing stale artifact `{}`", path.display()))?;
            }
        }
        Ok(())
    }
}

// --------------------- Fixture discovery -----------------------------------

struct Fixture {
    name: String,
    source: PathBuf,
    expected: PathBuf,
    produced: PathBuf,
}

impl Harness {
    fn discover(&self) -> Result<Vec<Fixture>> {
        let mut fixtures = Vec::new();
        for entry in WalkDir::new(&self.fixtures_dir).min_depth(1).max_depth(1) {
            let entry = entry.with_context(|| {
                format!(
                    "listing fixtures directory `{}`",
                    self.fixtures_dir.display()
                )
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SOURCE_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let artifact = format!("{stem}.{ARTIFACT_EXT}");
            fixtures.push(Fixture {
                name: stem.to_string(),
                source: path.to_path_buf(),
                expected: self.expectation_dir.join(&artifact),
                produced: self.output_dir.join(&artifact),
            });
        }
        // Directory order is platform noise; sort so reports are stable.
        fixtures.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(fixtures)
    }
}

// --------------------- Compiler invocation ---------------------------------

struct CompileOutput {
    code: Option<i32>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    timed_out: bool,
}

impl Harness {
    /// Runs the external compiler for one fixture and waits for it to exit
    /// or overrun the deadline. Artifact presence, not the exit status, is
    /// what decides compile success; the caller checks that afterwards.
    fn run_compiler(&self, fixture: &Fixture) -> Result<CompileOutput> {
        let mut command = Command::new(&self.interpreter);
        command
            .arg("-cp")
            .arg(&self.classpath)
            .arg(&self.entrypoint)
            .arg(&fixture.source)
            .arg("-o")
            .arg(&fixture.produced)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .with_context(|| format!("spawning {:?}", self.interpreter))?;

        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if Instant::now() >= deadline {
                child.kill().ok();
                child.wait()?;
                break None;
            }
            thread::sleep(Duration::from_millis(20));
        };

        Ok(CompileOutput {
            code: status.and_then(|s| s.code()),
            stdout: join_reader(stdout_reader),
            stderr: join_reader(stderr_reader),
            timed_out: status.is_none(),
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(src: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    src.map(|mut reader| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).ok();
            buf
        })
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Exit code and captured output, folded into the failure message so the
/// report stays the only channel.
fn diagnostics(output: &CompileOutput) -> String {
    let mut parts = Vec::new();
    match output.code {
        Some(code) => parts.push(format!("exit code {code}")),
        None => parts.push("killed by signal".to_string()),
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        parts.push(format!("stdout: {stdout}"));
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        parts.push(format!("stderr: {stderr}"));
    }
    format!(" ({})", parts.join(", "))
}

// --------------------- Artifact comparison ---------------------------------

fn compare_artifacts(expected: &Path, produced: &Path) -> Result<bool> {
    let want = fs::read(expected)
        .with_context(|| format!("reading expectation `{}`", expected.display()))?;
    let got = fs::read(produced)
        .with_context(|| format!("reading produced artifact `{}`", produced.display()))?;
    Ok(want == got)
}

// --------------------- Per-fixture execution -------------------------------

impl Harness {
    fn run_fixture(&self, fixture: &Fixture) -> TestOutcome {
        match self.try_fixture(fixture) {
            Ok(outcome) => outcome,
            Err(e) => {
                println!(" failed");
                TestOutcome::failed(
                    fixture,
                    Status::StructuralError,
                    format!("`{}.{SOURCE_EXT}` could not be tested: {e:#}", fixture.name),
                )
            }
        }
    }

    fn try_fixture(&self, fixture: &Fixture) -> Result<TestOutcome> {
        progress(&format!("Compiling `{}.{SOURCE_EXT}`...", fixture.name));
        let compiled = self.run_compiler(fixture)?;
        if compiled.timed_out {
            println!(" timed out");
            return Ok(TestOutcome::failed(
                fixture,
                Status::Timeout,
                format!(
                    "`{}.{SOURCE_EXT}` timed out after {}s",
                    fixture.name,
                    self.timeout.as_secs()
                ),
            ));
        }
        if !fixture.produced.is_file() {
            println!(" failed");
            return Ok(TestOutcome::failed(
                fixture,
                Status::CompileFailed,
                format!(
                    "`{}.{SOURCE_EXT}` couldn't be compiled{}",
                    fixture.name,
                    diagnostics(&compiled)
                ),
            ));
        }
        progress(" done, testing...");
        if !fixture.expected.is_file() {
            println!(" failed");
            return Ok(TestOutcome::failed(
                fixture,
                Status::StructuralError,
                format!(
                    "`{}.{SOURCE_EXT}` has no expectation file `{}`",
                    fixture.name,
                    fixture.expected.display()
                ),
            ));
        }
        if !compare_artifacts(&fixture.expected, &fixture.produced)? {
            println!(" failed");
            return Ok(TestOutcome::failed(
                fixture,
                Status::MismatchFailed,
                format!("`{}.{SOURCE_EXT}` produces unexpected results", fixture.name),
            ));
        }
        println!(" done.");
        Ok(TestOutcome::passed(fixture))
    }
}

fn progress(text: &str) {
    print!("{text}");
    let _ = io::stdout().flush();
}

// --------------------- Outcomes and summary --------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Passed,
    CompileFailed,
    MismatchFailed,
    Timeout,
    StructuralError,
}

struct TestOutcome {
    fixture_name: String,
    status: Status,
    message: Option<String>,
}

impl TestOutcome {
    fn passed(fixture: &Fixture) -> Self {
        Self {
            fixture_name: fixture.name.clone(),
            status: Status::Passed,
            message: None,
        }
    }

    fn failed(fixture: &Fixture, status: Status, message: String) -> Self {
        Self {
            fixture_name: fixture.name.clone(),
            status,
            message: Some(message),
        }
    }
}

struct RunLedger {
    outcomes: Vec<TestOutcome>,
}

impl RunLedger {
    fn new() -> Self {
        Self {
            outcomes: Vec::new(),
        }
    }

    fn record(&mut self, outcome: TestOutcome) {
        self.outcomes.push(outcome);
    }

    fn finish(self) -> RunSummary {
        RunSummary {
            outcomes: self.outcomes,
        }
    }
}

struct RunSummary {
    outcomes: Vec<TestOutcome>,
}

impl RunSummary {
    fn total(&self) -> usize {
        self.outcomes.len()
    }

    fn successful(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == Status::Passed)
            .count()
    }

    fn error_count(&self) -> usize {
        self.total() - self.successful()
    }

    fn failure_messages(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|o| o.status != Status::Passed)
            .filter_map(|o| o.message.as_deref())
    }

    fn summary_line(&self) -> String {
        format!(
            "{} tests, {} successful, {} errors.",
            self.total(),
            self.successful(),
            self.error_count()
        )
    }
}

// --------------------- Report printing -------------------------------------

fn print_report(summary: &RunSummary) {
    println!();
    println!("{0} Test-suit run complete {0}", "=".repeat(10));
    println!();
    println!("{}", summary.summary_line());
    if summary.error_count() > 0 {
        println!("{} errors detected:", summary.error_count());
        for (index, message) in summary.failure_messages().enumerate() {
            println!();
            println!(" {}. {}", index + 1, message);
        }
    }
}

// --------------------- Tests -----------------------------------------------
