use clap::Parser;
use qos_broker::{EvalError, FunctionRegistry, RuleSet, RulesParser};
use serde::Serialize;
use std::io::{self, Read};

/// Validate a broker rules file (or a single expression) and emit a JSON
/// report.
#[derive(Parser, Debug)]
#[command(
    name = "qos-broker-cli",
    about = "Validate broker rule files and canonicalize rule expressions"
)]
struct Args {
    /// Read the rules from a file instead of stdin
    #[arg(long)]
    file: Option<std::path::PathBuf>,

    /// Parse a single expression instead of a rules file
    #[arg(long)]
    expr: Option<String>,

    /// Declare a request attribute available to rules (repeatable), e.g.
    /// --define dataset --define adaptor
    #[arg(long = "define")]
    defines: Vec<String>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Report {
    Rules {
        ok: bool,
        priorities: usize,
        global_limits: usize,
        permissions: usize,
        user_limits: usize,
        rules: Vec<String>,
    },
    Expression {
        ok: bool,
        expression: String,
    },
    Error {
        ok: bool,
        error: String,
        line: u32,
    },
}

fn main() {
    let args = Args::parse();

    // Attribute functions declared on the command line parse like builtins;
    // their bodies just read the named request attribute.
    let registry = FunctionRegistry::new();
    for name in &args.defines {
        let attribute = name.clone();
        registry.register(name.clone(), move |ctx, values| {
            ctx.request
                .attribute(&attribute)
                .ok_or_else(|| EvalError::other(attribute.clone(), values, "attribute not set"))
        });
    }

    let report = if let Some(expr) = args.expr {
        check_expression(&expr, &registry)
    } else {
        let text = if let Some(path) = args.file {
            std::fs::read_to_string(&path).unwrap_or_else(|e| {
                eprintln!("Error reading file: {e}");
                std::process::exit(1);
            })
        } else {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf).unwrap_or_else(|e| {
                eprintln!("Error reading stdin: {e}");
                std::process::exit(1);
            });
            buf
        };
        check_rules(&text, &registry)
    };

    let json = serde_json::to_string(&report).expect("report is always serializable");
    println!("{json}");
    // Exit 0 always — parse errors are encoded in the JSON, not the exit code.
}

fn check_rules(text: &str, registry: &FunctionRegistry) -> Report {
    let mut rules = RuleSet::default();
    match RulesParser::new(text, registry).parse_rules(&mut rules) {
        Ok(()) => {
            let mut dump = Vec::new();
            rules.dump(&mut dump).expect("dump to memory cannot fail");
            let rules_text = String::from_utf8_lossy(&dump)
                .lines()
                .filter(|line| !line.starts_with('#') && !line.is_empty())
                .map(str::to_string)
                .collect();
            Report::Rules {
                ok: true,
                priorities: rules.priorities.len(),
                global_limits: rules.global_limits.len(),
                permissions: rules.permissions.len(),
                user_limits: rules.user_limits.len(),
                rules: rules_text,
            }
        }
        Err(e) => Report::Error {
            ok: false,
            error: e.message,
            line: e.line,
        },
    }
}

fn check_expression(text: &str, registry: &FunctionRegistry) -> Report {
    match RulesParser::new(text, registry).parse() {
        Ok(expr) => Report::Expression {
            ok: true,
            expression: expr.to_string(),
        },
        Err(e) => Report::Error {
            ok: false,
            error: e.message,
            line: e.line,
        },
    }
}
