use std::path::{Path, PathBuf};

use anyhow::Context;
use xenon_vm::cpu::{BackendKind, Config, DebugInfoFlags};

use crate::{
    parser::TestCase,
    tester::{Harness, Tester},
};

mod parser;
mod tester;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("XENON_LOG"))
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("{:?}", e);
        std::process::exit(1);
    }
}

const USAGE: &str =
    "usage: xenon-test [--interpreter-only] [--native-only] [--no-opt] [FILTER] <suite.s>...";

struct Options {
    interpreter_only: bool,
    native_only: bool,
    no_opt: bool,
    filter: Option<String>,
    suites: Vec<PathBuf>,
}

impl Options {
    fn parse(args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let mut options = Self {
            interpreter_only: false,
            native_only: false,
            no_opt: std::env::var_os("XENON_NO_OPT").is_some(),
            filter: None,
            suites: vec![],
        };

        for arg in args {
            match arg.as_str() {
                "--interpreter-only" => options.interpreter_only = true,
                "--native-only" => options.native_only = true,
                "--no-opt" => options.no_opt = true,
                "-h" | "--help" => anyhow::bail!("{USAGE}"),
                x if x.starts_with("--") => anyhow::bail!("unknown option: {x}\n{USAGE}"),
                x if x.ends_with(".s") || Path::new(x).is_file() => {
                    options.suites.push(PathBuf::from(x))
                }
                x => {
                    if options.filter.is_some() {
                        anyhow::bail!("more than one filter given\n{USAGE}");
                    }
                    options.filter = Some(x.to_owned());
                }
            }
        }

        if options.interpreter_only && options.native_only {
            anyhow::bail!("--interpreter-only and --native-only are mutually exclusive");
        }
        Ok(options)
    }

    fn backends(&self) -> Vec<BackendKind> {
        if self.interpreter_only {
            return vec![BackendKind::Interpreter];
        }
        if self.native_only {
            return vec![BackendKind::Native];
        }

        let mut backends = vec![BackendKind::Interpreter];
        if std::env::var_os("XENON_DISABLE_NATIVE").is_some() {
            tracing::info!("native backend disabled by XENON_DISABLE_NATIVE");
        }
        else if !BackendKind::native_supported() {
            tracing::warn!("native backend is not supported on {}", target_lexicon::HOST);
        }
        else {
            backends.push(BackendKind::Native);
        }
        backends
    }

    fn config(&self) -> anyhow::Result<Config> {
        let debug_info = match std::env::var("XENON_DEBUG_INFO") {
            Ok(value) => DebugInfoFlags::parse(&value)
                .ok_or_else(|| anyhow::format_err!("invalid XENON_DEBUG_INFO: {value}"))?,
            Err(_) => DebugInfoFlags::all(),
        };
        Ok(Config { optimize: !self.no_opt, validate: true, debug_info, ..Config::default() })
    }
}

fn run() -> anyhow::Result<()> {
    let mut options = Options::parse(std::env::args().skip(1))?;
    if options.suites.is_empty() {
        options.suites = default_suites()?;
    }

    let config = options.config()?;
    let backends = options.backends();
    tracing::debug!("testing {backends:?} with {config:?}");

    let mut failures = 0;
    for path in &options.suites {
        let (count, skip, errors) = run_suite(path, &config, &backends, options.filter.as_deref())?;
        eprintln!("{}: {} tests, {} skipped, {} errors", path.display(), count, skip, errors.len());
        for error in &errors {
            eprintln!("\t{}", error.replace('\n', "\n\t"));
        }
        failures += errors.len();
    }

    if failures != 0 {
        anyhow::bail!("{failures} test(s) failed");
    }
    Ok(())
}

fn default_suites() -> anyhow::Result<Vec<PathBuf>> {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("suites");
    let mut suites = vec![];
    for entry in std::fs::read_dir(&dir)
        .with_context(|| format!("failed to read suites from {}", dir.display()))?
    {
        let path = entry?.path();
        if path.extension().map_or(false, |x| x == "s") {
            suites.push(path);
        }
    }
    suites.sort();
    Ok(suites)
}

fn run_suite(
    path: &Path,
    config: &Config,
    backends: &[BackendKind],
    filter: Option<&str>,
) -> anyhow::Result<(usize, usize, Vec<String>)> {
    let input = std::fs::read_to_string(path)
        .with_context(|| format!("failed to load: {}", path.display()))?;
    let suite =
        parser::parse(&input).with_context(|| format!("error parsing: {}", path.display()))?;

    let mut harnesses = backends
        .iter()
        .map(|&backend| Harness::new(Config { backend, ..config.clone() }, &suite))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut errors = vec![];
    let mut skip = 0;
    for test in &suite.cases {
        if filter.map_or(false, |x| !test.name.contains(x)) {
            skip += 1;
            continue;
        }

        let prefix = format!("{}:{} test_{}", path.display(), test.line, test.name);
        let mut passed = true;
        for harness in &mut harnesses {
            if let Err(e) = check_one(harness, test) {
                passed = false;
                let mut error = format!("[{prefix}] {}: {e:#}", harness.backend);
                if let Some(dump) = harness.debug_dump(test) {
                    error.push('\n');
                    error.push_str(&dump);
                }
                errors.push(error);
            }
        }

        if passed {
            if let Some(error) = compare_backends(&harnesses, test) {
                errors.push(format!("[{prefix}] {error}"));
            }
        }
    }

    Ok((suite.cases.len(), skip, errors))
}

fn check_one<T: Tester>(tester: &mut T, test: &TestCase) -> anyhow::Result<()> {
    tester.init(test)?;
    for assignment in &test.inputs {
        tracing::trace!("writing: {assignment}");
        tester.write_assignment(assignment)?;
    }

    tester.run(test)?;

    let failures: Vec<_> = test
        .outputs
        .iter()
        .filter_map(|assignment| tester.check_assignment(assignment).err())
        .map(|e| e.to_string())
        .collect();
    anyhow::ensure!(failures.is_empty(), "{}", failures.join("\n"));
    Ok(())
}

/// Checks that every backend left the register file in the same state as the first one.
fn compare_backends(harnesses: &[Harness], test: &TestCase) -> Option<String> {
    let (first, rest) = harnesses.split_first()?;
    for other in rest {
        let diff = tester::diff_contexts(first.context(), other.context());
        if diff.is_empty() {
            continue;
        }
        let mut error =
            format!("{} and {} disagree:\n{}", first.backend, other.backend, diff.join("\n"));
        for harness in [first, other] {
            if let Some(dump) = harness.debug_dump(test) {
                error.push_str(&format!("\n{}:\n{dump}", harness.backend));
            }
        }
        return Some(error);
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    fn options(args: &[&str]) -> anyhow::Result<Options> {
        Options::parse(args.iter().map(|x| x.to_string()))
    }

    #[test]
    fn command_line() {
        let opts = options(&["--interpreter-only", "add", "suites/add.s", "logic.s"]).unwrap();
        assert!(opts.interpreter_only);
        assert_eq!(opts.filter.as_deref(), Some("add"));
        assert_eq!(opts.suites, [PathBuf::from("suites/add.s"), PathBuf::from("logic.s")]);
        assert_eq!(opts.backends(), [BackendKind::Interpreter]);

        assert!(options(&["--native-only", "--interpreter-only"]).is_err());
        assert!(options(&["a", "b"]).is_err());
        assert!(options(&["--bogus"]).is_err());
    }

    #[test]
    fn bundled_suites_pass_on_the_interpreter() {
        let config =
            Config { validate: true, debug_info: DebugInfoFlags::all(), ..Config::default() };
        for path in default_suites().unwrap() {
            let (count, _, errors) =
                run_suite(&path, &config, &[BackendKind::Interpreter], None).unwrap();
            assert!(count > 0, "{} has no tests", path.display());
            assert!(errors.is_empty(), "{}:\n{}", path.display(), errors.join("\n"));
        }
    }
}
