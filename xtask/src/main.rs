use std::{
    env,
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
    process::Command,
    time::SystemTime,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

struct Task {
    name: &'static str,
    deps: &'static [&'static str],
    run: fn() -> Result<()>,
}

fn no_work() -> Result<()> {
    Ok(())
}

const TASKS: &[Task] = &[
    Task {
        name: "compile-shaders",
        deps: &[],
        run: compile_shaders,
    },
    Task {
        name: "cargo-build",
        deps: &[],
        run: cargo_build,
    },
    Task {
        name: "build",
        deps: &["compile-shaders", "cargo-build"],
        run: no_work,
    },
];

fn main() {
    if let Err(e) = try_main() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let Some(task) = env::args().nth(1) else {
        eprintln!("Usage: cargo xtask <task>\n\nTasks:");
        for t in TASKS {
            eprintln!("  {}", t.name);
        }
        std::process::exit(1);
    };
    run_graph(&task)
}

#[derive(Clone, Copy, PartialEq)]
enum Outcome {
    Ok,
    Failed,
    Skipped,
}

fn find_task(name: &str) -> Result<usize> {
    TASKS
        .iter()
        .position(|t| t.name == name)
        .ok_or_else(|| format!("no task named `{name}`").into())
}

/// Run task `idx` after its dependencies, memoizing outcomes so shared
/// dependencies run once. A task whose dependency did not succeed is
/// skipped.
fn run_task(idx: usize, outcomes: &mut [Option<Outcome>]) -> Result<Outcome> {
    if let Some(done) = outcomes[idx] {
        return Ok(done);
    }
    // Marked before recursing so a dependency cycle bottoms out as a skip
    // instead of looping.
    outcomes[idx] = Some(Outcome::Skipped);

    let task = &TASKS[idx];
    let mut ready = true;
    for dep in task.deps {
        ready &= run_task(find_task(dep)?, outcomes)? == Outcome::Ok;
    }

    let outcome = if ready {
        match (task.run)() {
            Ok(()) => Outcome::Ok,
            Err(e) => {
                eprintln!("failed: {} ({e})", task.name);
                Outcome::Failed
            }
        }
    } else {
        eprintln!("skip: {}", task.name);
        Outcome::Skipped
    };
    outcomes[idx] = Some(outcome);
    Ok(outcome)
}

fn run_graph(target: &str) -> Result<()> {
    let mut outcomes = vec![None; TASKS.len()];
    run_task(find_task(target)?, &mut outcomes)?;

    let failed: Vec<&str> = TASKS
        .iter()
        .enumerate()
        .filter(|&(i, _)| outcomes[i] == Some(Outcome::Failed))
        .map(|(_, t)| t.name)
        .collect();

    if failed.is_empty() {
        Ok(())
    } else {
        Err(format!("{} task(s) failed: {}", failed.len(), failed.join(", ")).into())
    }
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("xtask lives one level below the workspace root")
        .to_path_buf()
}

fn mtime(path: &Path) -> Option<SystemTime> {
    path.metadata().ok()?.modified().ok()
}

fn is_up_to_date(src: &Path, dst: &Path) -> bool {
    match (mtime(src), mtime(dst)) {
        (Some(src_mtime), Some(dst_mtime)) => src_mtime <= dst_mtime,
        _ => false,
    }
}

fn run(cmd: &mut Command) -> Result<()> {
    let status = cmd.status()?;
    if !status.success() {
        return Err(format!("{:?} exited with {status}", cmd.get_program()).into());
    }
    Ok(())
}

fn cargo_build() -> Result<()> {
    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    run(Command::new(cargo)
        .args(["build", "-p", "gw-app"])
        .current_dir(workspace_root()))
}

/// Regenerate the checked-in SPIR-V next to the GLSL sources. The app
/// embeds the binaries with `include_bytes!`, so they live in the tree
/// rather than in a build directory.
fn compile_shaders() -> Result<()> {
    let shader_dir = workspace_root().join("gw-app").join("shaders");

    let mut compiled = 0u32;
    let mut skipped = 0u32;

    for entry in fs::read_dir(&shader_dir)? {
        let src = entry?.path();
        let is_stage_source = matches!(
            src.extension().and_then(OsStr::to_str),
            Some("vert" | "frag")
        );
        if !is_stage_source {
            continue;
        }
        let Some(file_name) = src.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let dst = shader_dir.join(format!("{file_name}.spv"));

        if is_up_to_date(&src, &dst) {
            skipped += 1;
            continue;
        }

        println!("Compiling {file_name} -> {file_name}.spv");
        run(Command::new("glslc").arg(&src).arg("-o").arg(&dst))?;
        compiled += 1;
    }

    println!("Shaders: {compiled} compiled, {skipped} up-to-date");
    Ok(())
}
