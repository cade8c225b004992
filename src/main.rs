use std::io::{self, Write};

use james_shell::editor::{LineEditor, EDITOR_ACTIVE};
use james_shell::shell::Shell;

#[derive(clap::Parser)]
#[command(name = "james-shell", version, about = "A POSIX job-control shell")]
struct Cli {
    /// Run a single command non-interactively instead of starting a REPL.
    #[arg(short = 'c')]
    command: Option<String>,
}

fn main() {
    // The session helper re-exec (spec.md §4.6) bypasses the normal CLI
    // parser entirely: it's an internal entry point, not a user-facing flag.
    #[cfg(unix)]
    if std::env::args().nth(1).as_deref() == Some("--session-helper") {
        james_shell::session_helper::helper_main();
    }

    let cli = <Cli as clap::Parser>::parse();

    ctrlc::set_handler(|| {
        // Raw-mode input handles Ctrl-C itself as a key event (ISIG is off);
        // this handler only fires for the fallback (non-tty) read path.
        if !EDITOR_ACTIVE.load(std::sync::atomic::Ordering::Relaxed) {
            println!();
            let _ = io::stdout().flush();
        }
    })
    .expect("Failed to set Ctrl-C handler");

    let mut shell = Shell::new().expect("failed to initialize shell");

    let code = match cli.command {
        Some(command) => run_command(&mut shell, &command),
        None => run_interactive(&mut shell),
    };

    std::process::exit(code);
}

fn run_command(shell: &mut Shell, command: &str) -> i32 {
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    match shell.execute_line(command, &mut stdout, &mut stderr) {
        Some(code) => code,
        None => shell.last_exit_code,
    }
}

fn run_interactive(shell: &mut Shell) -> i32 {
    let mut editor = LineEditor::new();
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();

    loop {
        let prompt = shell.prompt();
        match editor.read_line(&prompt) {
            Ok(Some(line)) => {
                editor.add_to_history(&line);
                if line.trim().is_empty() {
                    continue;
                }
                if let Some(code) = shell.execute_line(&line, &mut stdout, &mut stderr) {
                    return code;
                }
            }
            Ok(None) => return shell.last_exit_code,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                eprintln!("jsh: {e}");
                return shell.last_exit_code;
            }
        }
    }
}
