use console::style;

use havoc::config::FleetConfig;
use havoc::driver::Node;
use havoc::error::{HavocError, Result};

pub fn add(name: String, endpoint: String, group: String, secret: String) -> Result<()> {
    if name.trim().is_empty() || endpoint.trim().is_empty() {
        return Err(HavocError::Config(
            "Node name and endpoint must not be empty".to_string(),
        ));
    }

    let mut fleet = FleetConfig::load()?;
    let existed = fleet.nodes.iter().any(|n| n.name == name);
    fleet.add_node(Node {
        name: name.clone(),
        endpoint: endpoint.clone(),
        group: group.clone(),
        secret,
    });
    fleet.save()?;

    let verb = if existed { "Updated" } else { "Added" };
    println!(
        "{} {} node {} at {}{}",
        style("✓").green().bold(),
        verb,
        style(&name).cyan(),
        style(&endpoint).white(),
        if group.is_empty() {
            String::new()
        } else {
            format!(" in group {}", style(&group).yellow())
        }
    );
    println!(
        "  Fleet file: {}",
        style(FleetConfig::fleet_path()?.display()).dim()
    );

    Ok(())
}

pub fn list() -> Result<()> {
    let fleet = FleetConfig::load()?;
    let registry = fleet.to_registry();

    if registry.is_empty() {
        println!("{}", style("No nodes registered.").dim());
        println!(
            "Run {} to add one.",
            style("havoc node add <name> <endpoint> --secret <key>").cyan()
        );
        return Ok(());
    }

    println!("{}", style("Nodes").bold().cyan());
    println!();
    for node in registry.nodes() {
        println!(
            "  {:<20} {:<28} {}",
            style(&node.name).white(),
            style(&node.endpoint).dim(),
            style(&node.group).yellow()
        );
    }

    let groups = registry.group_names();
    if !groups.is_empty() {
        println!();
        println!("{}", style("Groups").bold().cyan());
        println!();
        for group in groups {
            let members = registry.group(group).unwrap_or_default();
            println!("  {:<20} {}", style(group).yellow(), members.join(", "));
        }
    }

    Ok(())
}
