//! REPL (Read-Eval-Print Loop) for corvid
//!
//! Each input runs as its own chunk in one VM, so globals persist between
//! inputs while `local`s do not.

use anyhow::Result;
use corvid_core::bytecode::CompileErrorKind;
use corvid_core::lexer::{LexError, TokenKind};
use corvid_core::parser::ParseErrorKind;
use corvid_core::{Error, Value, VmConfig, VmResult, MULTRET, VM};
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{DefaultEditor, Editor};

/// REPL prompt shown at the start of each line
const PROMPT: &str = "> ";
/// Continuation prompt for multi-line input
const CONTINUATION_PROMPT: &str = ">> ";
/// History file name
const HISTORY_FILE: &str = ".corvid_history";
/// Nesting limit when rendering tables as JSON
const MAX_JSON_DEPTH: usize = 16;

/// Result of processing a REPL command
enum CommandResult {
    /// Continue the REPL loop
    Continue,
    /// Exit the REPL
    Exit,
    /// Input was handled as a command (no further evaluation needed)
    Handled,
}

/// The corvid REPL
pub struct Repl {
    vm: VM,
    config: VmConfig,
    editor: Editor<(), DefaultHistory>,
}

impl Repl {
    /// Create a new REPL instance
    pub fn new(config: VmConfig) -> Result<Self> {
        let vm = VM::with_config(config);
        let mut editor = DefaultEditor::new()?;

        if let Some(home) = home_dir() {
            let _ = editor.load_history(&home.join(HISTORY_FILE));
        }

        Ok(Self { vm, config, editor })
    }

    /// Run the REPL loop
    pub fn run(&mut self) -> Result<()> {
        println!("corvid v{}", corvid_core::VERSION);
        println!("Type :help for help, :quit to exit");
        println!();

        loop {
            match self.read_input() {
                Ok(Some(input)) => {
                    match self.handle_command(&input) {
                        CommandResult::Exit => break,
                        CommandResult::Handled => continue,
                        CommandResult::Continue => {}
                    }
                    self.eval_and_print(&input);
                }
                Ok(None) => continue,
                Err(ReadlineError::Interrupted) => {
                    println!("^C");
                    continue;
                }
                Err(ReadlineError::Eof) => {
                    println!("Goodbye!");
                    break;
                }
                Err(err) => {
                    eprintln!("Error reading input: {err}");
                    break;
                }
            }
        }

        if let Some(home) = home_dir() {
            let _ = self.editor.save_history(&home.join(HISTORY_FILE));
        }

        Ok(())
    }

    /// Read input from the user, continuing while the chunk is unfinished
    fn read_input(&mut self) -> Result<Option<String>, ReadlineError> {
        let mut input = String::new();
        let mut prompt = PROMPT;

        loop {
            let line = self.editor.readline(prompt)?;

            if input.is_empty() && line.trim().is_empty() {
                return Ok(None);
            }

            if !input.is_empty() {
                input.push('\n');
            }
            input.push_str(&line);

            if input.trim_start().starts_with(':') || is_complete(&input) {
                let _ = self.editor.add_history_entry(&input);
                return Ok(Some(input));
            }

            prompt = CONTINUATION_PROMPT;
        }
    }

    /// Handle REPL commands (starting with :)
    fn handle_command(&mut self, input: &str) -> CommandResult {
        let trimmed = input.trim();

        if !trimmed.starts_with(':') {
            return CommandResult::Continue;
        }

        let cmd = trimmed.trim_start_matches(':').trim();
        let (cmd_name, _args) = cmd.split_once(' ').unwrap_or((cmd, ""));

        match cmd_name.to_lowercase().as_str() {
            "quit" | "q" | "exit" => CommandResult::Exit,

            "help" | "h" | "?" => {
                print_help();
                CommandResult::Handled
            }

            "clear" | "cls" => {
                print!("\x1B[2J\x1B[1;1H");
                CommandResult::Handled
            }

            "gc" => {
                self.vm.collect_garbage();
                let stats = self.vm.gc_stats();
                println!(
                    "{} cycles, {} live bytes, {} objects, {} freed",
                    stats.cycles, stats.live_bytes, stats.objects, stats.objects_freed
                );
                CommandResult::Handled
            }

            "reset" => {
                self.vm = VM::with_config(self.config);
                println!("VM reset");
                CommandResult::Handled
            }

            _ => {
                println!("Unknown command: :{cmd_name}");
                println!("Type :help for available commands");
                CommandResult::Handled
            }
        }
    }

    /// Evaluate input and print the results
    fn eval_and_print(&mut self, input: &str) {
        let base = self.vm.top();
        match evaluate(&mut self.vm, "=stdin", input) {
            Ok(count) => {
                let rendered: Vec<String> = (base + 1..=base + count)
                    .map(|i| pretty_print(&self.vm, self.vm.read(i as i32)))
                    .collect();
                if !rendered.is_empty() {
                    println!("{}", rendered.join("\t"));
                }
                self.vm.set_top(base);
            }
            Err(Error::Runtime(err)) => eprintln!("{}", err.report()),
            Err(err) => eprintln!("{err}"),
        }
    }
}

/// Run `source`, first as `return <source>` so bare expressions print.
///
/// Returns how many results were left on the stack.
pub fn evaluate(vm: &mut VM, chunk_name: &str, source: &str) -> VmResult<usize> {
    let before = vm.top();
    let expression = format!("return {source}");
    if vm.load_source(chunk_name, &expression).is_err() {
        vm.load_source(chunk_name, source)?;
    }
    vm.protected_call(0, MULTRET)?;
    Ok(vm.top() - before)
}

/// Whether the source is a finished chunk rather than one cut off early
fn is_complete(source: &str) -> bool {
    match corvid_core::bytecode::compile_chunk(source, "stdin", &corvid_core::CompileOptions::default()) {
        Ok(_) => true,
        Err(err) => !matches!(
            err.kind,
            CompileErrorKind::Syntax(
                ParseErrorKind::UnexpectedToken { found: TokenKind::Eof, .. }
                    | ParseErrorKind::Unclosed { found: TokenKind::Eof, .. }
                    | ParseErrorKind::ExpectedExpression(TokenKind::Eof)
                    | ParseErrorKind::Lex(LexError::UnterminatedLongString | LexError::UnterminatedComment)
                    | ParseErrorKind::InvalidString(LexError::UnterminatedLongString)
            )
        ),
    }
}

/// Render a value for REPL output; strings are quoted
fn pretty_print(vm: &VM, value: Value) -> String {
    match value {
        Value::String(_) => format!("{:?}", vm.display_value(value)),
        other => vm.display_value(other),
    }
}

/// Convert the value at `index` to JSON
pub fn to_json(vm: &VM, index: i32) -> serde_json::Value {
    value_to_json(vm, vm.read(index), 0)
}

fn value_to_json(vm: &VM, value: Value, depth: usize) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::Nil => Json::Null,
        Value::Boolean(b) => Json::Bool(b),
        Value::Integer(i) => Json::from(i),
        Value::UnsignedInteger(u) => Json::from(u),
        Value::Number(n) => serde_json::Number::from_f64(n).map_or_else(|| Json::String(vm.display_value(value)), Json::Number),
        Value::Vector(v) => Json::from(vec![f64::from(v.x), f64::from(v.y), f64::from(v.z)]),
        Value::String(h) => Json::String(String::from_utf8_lossy(vm.heap().string(h)).into_owned()),
        Value::Table(h) if depth < MAX_JSON_DEPTH => {
            let table = vm.heap().table(h);
            let len = table.len();
            let entries: Vec<(Value, Value)> = table.iter().collect();
            if len > 0 && entries.len() == len {
                Json::Array((1..=len).map(|i| value_to_json(vm, table.get_int(i as i64), depth + 1)).collect())
            } else {
                let object = entries
                    .into_iter()
                    .map(|(k, v)| (vm.display_value(k), value_to_json(vm, v, depth + 1)))
                    .collect();
                Json::Object(object)
            }
        }
        other => Json::String(vm.display_value(other)),
    }
}

/// Print help information
fn print_help() {
    println!(
        r#"
corvid REPL Commands:
  :help, :h, :?    Show this help message
  :quit, :q        Exit the REPL
  :clear, :cls     Clear the screen
  :gc              Run a full collection and show heap statistics
  :reset           Start over with a fresh VM

Tips:
  - Globals persist across inputs, locals do not
  - Unfinished blocks continue on the next line
  - Press Ctrl+C to cancel current input
  - Press Ctrl+D to exit

Examples:
  > 1 + 2 * 3
  7
  > function sq(x) return x * x end
  > sq(12), "done"
  144	"done"
"#
    );
}

/// Get the user's home directory
fn home_dir() -> Option<std::path::PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(std::path::PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_complete_simple() {
        assert!(is_complete("1 + 2"));
        assert!(is_complete("x = 1"));
        assert!(is_complete(""));
    }

    #[test]
    fn test_is_complete_blocks() {
        assert!(!is_complete("function f()"));
        assert!(!is_complete("if x then\n  y = 1"));
        assert!(!is_complete("local t = {1, 2"));
        assert!(!is_complete("print(1,"));
        assert!(is_complete("function f() return 1 end"));
        assert!(is_complete("for i = 1, 3 do print(i) end"));
    }

    #[test]
    fn test_is_complete_long_strings() {
        assert!(!is_complete("s = [[first line"));
        assert!(!is_complete("--[[ open comment"));
        assert!(is_complete("s = [[done]]"));
    }

    #[test]
    fn test_syntax_errors_are_complete() {
        assert!(is_complete("x = = 1"));
        assert!(is_complete("end"));
    }

    #[test]
    fn test_evaluate_expressions_and_statements() {
        let mut vm = VM::new();
        assert_eq!(evaluate(&mut vm, "=t", "1 + 2").unwrap(), 1);
        assert_eq!(vm.to_number(-1).unwrap(), 3.0);
        vm.set_top(0);
        assert_eq!(evaluate(&mut vm, "=t", "answer = 42").unwrap(), 0);
        assert_eq!(evaluate(&mut vm, "=t", "answer, 'x'").unwrap(), 2);
        assert_eq!(vm.to_number(1).unwrap(), 42.0);
        assert_eq!(vm.to_str(2).unwrap(), "x");
    }

    #[test]
    fn test_pretty_print_quotes_strings() {
        let mut vm = VM::new();
        vm.push_string("hi");
        vm.push_number(1.5);
        assert_eq!(pretty_print(&vm, vm.read(1)), "\"hi\"");
        assert_eq!(pretty_print(&vm, vm.read(2)), "1.5");
    }

    #[test]
    fn test_json_rendering() {
        let mut vm = VM::new();
        evaluate(&mut vm, "=t", "{1, 'two', true}, {name = 'x'}, 0/0").unwrap();
        assert_eq!(to_json(&vm, 1), serde_json::json!([1.0, "two", true]));
        assert_eq!(to_json(&vm, 2), serde_json::json!({"name": "x"}));
        assert_eq!(to_json(&vm, 3), serde_json::json!("nan"));
    }
}
