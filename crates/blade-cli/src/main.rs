//! The `blade` launcher: runs script files or an interactive REPL.
//!
//! Exit codes follow BSD sysexits: 0 success, 64 usage, 65 compile error,
//! 70 uncaught runtime error, 71 internal error (stack overflow).

use std::path::PathBuf;
use std::process::ExitCode;

use blade::{Error, Runtime, RuntimeOptions, Value};
use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

#[derive(Parser)]
#[command(
    name = "blade",
    version,
    about = "The Blade scripting language",
    disable_help_flag = false
)]
struct Cli {
    /// Script file to run; starts a REPL when omitted.
    script: Option<PathBuf>,

    /// Arguments passed through to the script (os.args()).
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,

    /// Print bytecode disassembly before executing.
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Parse and compile only; do not execute.
    #[arg(short = 'j', long = "just-compile")]
    just_compile: bool,

    /// Buffer script output and flush it at exit.
    #[arg(short = 'b', long = "buffer-output")]
    buffer_output: bool,

    /// Initial GC threshold in bytes.
    #[arg(short = 'g', long = "gc-threshold", value_name = "BYTES")]
    gc_threshold: Option<usize>,
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            use clap::error::ErrorKind;
            let code: u8 = match error.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 64,
            };
            let _ = error.print();
            return ExitCode::from(code);
        }
    };

    let options = RuntimeOptions {
        gc_threshold: cli
            .gc_threshold
            .unwrap_or(blade::heap::DEFAULT_GC_THRESHOLD),
        buffer_output: cli.buffer_output,
        import_roots: import_roots(),
        script_args: cli.args.clone(),
    };

    match cli.script {
        Some(script) => run_script(script, options, cli.debug, cli.just_compile),
        None => repl(options),
    }
}

/// Import roots: the executable's directory plus every `BLADE_PATH` entry.
fn import_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            roots.push(dir.to_path_buf());
        }
    }
    if let Ok(blade_path) = std::env::var("BLADE_PATH") {
        for entry in std::env::split_paths(&blade_path) {
            if !entry.as_os_str().is_empty() {
                roots.push(entry);
            }
        }
    }
    roots
}

fn run_script(
    script: PathBuf,
    options: RuntimeOptions,
    debug: bool,
    just_compile: bool,
) -> ExitCode {
    let buffered = options.buffer_output;
    let mut runtime = Runtime::with_options(options);

    let source = match std::fs::read_to_string(&script) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("blade: cannot read {}: {}", script.display(), error);
            return ExitCode::from(66);
        }
    };

    if debug || just_compile {
        match runtime.disassemble(&source) {
            Ok(listing) => {
                if debug {
                    print!("{}", listing);
                }
            }
            Err(error) => return report(error),
        }
        if just_compile {
            return ExitCode::SUCCESS;
        }
    }

    let result = runtime.run_file(&script);
    if buffered {
        print!("{}", runtime.take_output());
    }
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(error) => report(error),
    }
}

fn report(error: Error) -> ExitCode {
    match &error {
        Error::Exit(code) => return ExitCode::from((*code & 0xff) as u8),
        other => eprintln!("{}", other),
    }
    ExitCode::from((error.exit_code() & 0xff) as u8)
}

/// The interactive loop: statements accumulate until a blank line, then
/// evaluate in the persistent top-level module. The value of a trailing
/// expression is echoed back.
fn repl(options: RuntimeOptions) -> ExitCode {
    let mut runtime = Runtime::with_options(RuntimeOptions {
        buffer_output: false,
        ..options
    });
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(error) => {
            eprintln!("blade: cannot start line editor: {}", error);
            return ExitCode::from(71);
        }
    };

    println!("Blade {} — blank line runs the buffer, Ctrl-D exits", env!("CARGO_PKG_VERSION"));
    let mut buffer = String::new();
    loop {
        let prompt = if buffer.is_empty() { "> " } else { ". " };
        match editor.readline(prompt) {
            Ok(line) => {
                if line.trim().is_empty() {
                    if buffer.is_empty() {
                        continue;
                    }
                    let source = std::mem::take(&mut buffer);
                    let _ = editor.add_history_entry(source.trim_end());
                    evaluate(&mut runtime, &source);
                    continue;
                }
                buffer.push_str(&line);
                buffer.push('\n');
                // Single complete lines evaluate immediately; anything that
                // still has an open block waits for the blank line.
                if !continues(&buffer) {
                    let source = std::mem::take(&mut buffer);
                    let _ = editor.add_history_entry(source.trim_end());
                    evaluate(&mut runtime, &source);
                }
            }
            Err(ReadlineError::Interrupted) => {
                buffer.clear();
            }
            Err(ReadlineError::Eof) => return ExitCode::SUCCESS,
            Err(error) => {
                eprintln!("blade: {}", error);
                return ExitCode::from(71);
            }
        }
    }
}

/// Crude open-delimiter balance check deciding whether the REPL should
/// keep reading lines.
fn continues(source: &str) -> bool {
    let mut depth: i32 = 0;
    let mut in_string: Option<char> = None;
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match in_string {
            Some(quote) => {
                if c == '\\' {
                    chars.next();
                } else if c == quote {
                    in_string = None;
                }
            }
            None => match c {
                '\'' | '"' => in_string = Some(c),
                '#' => {
                    for c in chars.by_ref() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                '{' | '(' | '[' => depth += 1,
                '}' | ')' | ']' => depth -= 1,
                _ => {}
            },
        }
    }
    depth > 0 || in_string.is_some()
}

fn evaluate(runtime: &mut Runtime, source: &str) {
    match runtime.run(source) {
        Ok(Value::Nil) => {}
        Ok(value) => println!("{}", runtime.display(value)),
        Err(Error::Exit(code)) => std::process::exit(code),
        Err(error) => eprintln!("{}", error),
    }
}
