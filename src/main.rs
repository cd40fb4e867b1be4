use std::io::Write;
use std::panic;
use std::path::PathBuf;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use javabox::{ExecutionRequest, JavaBox, JavaBoxConfig, Outcome, Submission};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    set_panic_hook();

    let mut args = std::env::args_os().skip(1);
    let Some(path) = args.next().map(PathBuf::from) else {
        eprintln!("usage: javabox <file.java> [entry-class]");
        return ExitCode::from(64);
    };
    let entry_point = args.next().and_then(|arg| arg.into_string().ok());

    let source = match std::fs::read_to_string(&path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("cannot read {}: {error}", path.display());
            return ExitCode::from(66);
        }
    };

    let mut submission = Submission::java(source);
    if let Some(entry_point) = entry_point {
        submission = submission.with_entry_point(entry_point);
    }

    let executor = JavaBox::new(JavaBoxConfig::default());
    let result = executor.execute(ExecutionRequest::new(submission)).await;

    let _ = std::io::stdout().write_all(&result.stdout.bytes);
    let _ = std::io::stderr().write_all(&result.stderr.bytes);
    if result.stdout.truncated || result.stderr.truncated {
        eprintln!();
        eprintln!("[output truncated]");
    }
    tracing::info!(
        outcome = ?result.outcome,
        exit_code = ?result.exit_code,
        elapsed_ms = result.elapsed.as_millis() as u64,
        "execution finished"
    );

    match result.outcome {
        Outcome::Success => ExitCode::SUCCESS,
        Outcome::RuntimeError => ExitCode::from(1),
        Outcome::CompileError => ExitCode::from(2),
        Outcome::Timeout => ExitCode::from(124),
        Outcome::ResourceExceeded => ExitCode::from(137),
        Outcome::InternalError => ExitCode::from(70),
    }
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
