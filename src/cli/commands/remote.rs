use console::style;
use serde_json::{Map, Value};

use havoc::config::FleetConfig;
use havoc::driver::{DispatchResult, Driver, NodeRegistry, NodeResult, Targets};
use havoc::error::{HavocError, Result};
use havoc::protocol::command_name;

/// A remote command as typed on the command line.
#[derive(Debug, PartialEq)]
pub struct Invocation {
    pub command: String,
    pub arguments: Option<Map<String, Value>>,
}

/// Split `kill process --names=nginx --pids=1,2` into a command name and an
/// arguments object. Values stay strings; the agent parses them.
pub fn parse_invocation(words: &[String]) -> Result<Invocation> {
    let mut command_words = Vec::new();
    let mut arguments = Map::new();

    for word in words {
        match word.strip_prefix("--") {
            Some(flag) => {
                let (key, value) = match flag.split_once('=') {
                    Some((k, v)) => (k, Value::String(v.to_string())),
                    None => (flag, Value::Bool(true)),
                };
                if key.is_empty() {
                    return Err(HavocError::InvalidCommand(format!(
                        "Malformed argument '{}'",
                        word
                    )));
                }
                arguments.insert(key.replace('-', "_"), value);
            }
            None => command_words.push(word.as_str()),
        }
    }

    let command = command_name(&command_words);
    if command.is_empty() {
        return Err(HavocError::InvalidCommand(
            "No command given (e.g. 'list process')".to_string(),
        ));
    }

    Ok(Invocation {
        command,
        arguments: (!arguments.is_empty()).then_some(arguments),
    })
}

pub async fn run(nodes: Vec<String>, groups: Vec<String>, words: Vec<String>) -> Result<()> {
    let invocation = parse_invocation(&words)?;
    let fleet = FleetConfig::load()?;
    let registry = fleet.to_registry();
    if registry.is_empty() {
        return Err(HavocError::NoNodesConfigured);
    }

    let driver = Driver::with_timeout(registry, fleet.timeout())?;
    let targets = Targets::nodes(nodes).with_groups(groups);

    println!(
        "{} Sending {}...",
        style("→").cyan().bold(),
        style(&invocation.command).cyan()
    );
    let results = driver
        .dispatch(&invocation.command, invocation.arguments, &targets)
        .await?;
    print_results(&results)
}

pub async fn send(address: String, key: String, words: Vec<String>) -> Result<()> {
    let invocation = parse_invocation(&words)?;

    let mut registry = NodeRegistry::new();
    registry.add_node(&address, &address, "", &key);
    let driver = Driver::new(registry)?;

    let results = driver
        .dispatch(&invocation.command, invocation.arguments, &Targets::all())
        .await?;
    print_results(&results)
}

fn print_results(results: &DispatchResult) -> Result<()> {
    for (node, result) in results {
        let marker = match result {
            NodeResult::Failed(_) => style("✗").red().bold(),
            NodeResult::Reply(v) if is_error_reply(v) => style("!").yellow().bold(),
            NodeResult::Reply(_) => style("✓").green().bold(),
        };
        println!("\n{} {}", marker, style(node).bold());
        println!("{}", serde_json::to_string_pretty(result)?);
    }
    Ok(())
}

/// Agent-side rejections and failed operations both carry `status`.
fn is_error_reply(value: &Value) -> bool {
    match value.get("status").and_then(Value::as_str) {
        Some("success") | None => false,
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn words(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_parse_words_and_flags() {
        let inv = parse_invocation(&words("kill process --names=nginx* --pids=1,2")).unwrap();
        assert_eq!(inv.command, "kill_process");
        assert_eq!(
            Value::Object(inv.arguments.unwrap()),
            json!({"names": "nginx*", "pids": "1,2"})
        );
    }

    #[test]
    fn test_parse_without_arguments() {
        let inv = parse_invocation(&words("list network adapters")).unwrap();
        assert_eq!(inv.command, "list_network_adapters");
        assert!(inv.arguments.is_none());
    }

    #[test]
    fn test_parse_normalizes_flag_names() {
        let inv = parse_invocation(&words("burn disk --file-size=1m --verbose")).unwrap();
        let args = inv.arguments.unwrap();
        assert_eq!(args["file_size"], "1m");
        assert_eq!(args["verbose"], true);
    }

    #[test]
    fn test_parse_keeps_equals_in_value() {
        let inv = parse_invocation(&words("exec command --cmd=a=b")).unwrap();
        assert_eq!(inv.arguments.unwrap()["cmd"], "a=b");
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(parse_invocation(&words("--pids=1")).is_err());
        assert!(parse_invocation(&words("kill --=1")).is_err());
    }

    #[test]
    fn test_error_reply_detection() {
        assert!(!is_error_reply(&json!({"list": []})));
        assert!(!is_error_reply(&json!({"status": "success", "message": "ok"})));
        assert!(is_error_reply(&json!({"status": "authorization_failed", "value": "x"})));
        assert!(is_error_reply(&json!({"status": "error", "message": "x"})));
    }
}
