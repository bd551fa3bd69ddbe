//! Node tree rendering for finished workflows.

use std::collections::BTreeSet;

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use weft_types::node::{Node, NodePhase};
use weft_types::workflow::{Workflow, WorkflowPhase};

/// Nodes in display order with their depth. Roots (the entrypoint first,
/// then e.g. the exit handler) are followed by their children depth-first.
pub fn tree_rows(workflow: &Workflow) -> Vec<(usize, &Node)> {
    let nodes = &workflow.status.nodes;
    let children: BTreeSet<&str> = nodes
        .iter()
        .flat_map(|n| n.children.iter().map(String::as_str))
        .collect();
    let mut roots: Vec<&Node> = nodes
        .iter()
        .filter(|n| !children.contains(n.id.as_str()))
        .collect();
    roots.sort_by_key(|n| (n.id != workflow.metadata.name, n.started_at));

    let mut rows = Vec::with_capacity(nodes.len());
    let mut seen = BTreeSet::new();
    let mut stack: Vec<(usize, &Node)> = roots.into_iter().rev().map(|n| (0, n)).collect();
    while let Some((depth, node)) = stack.pop() {
        if !seen.insert(node.id.as_str()) {
            continue;
        }
        rows.push((depth, node));
        for child in node.children.iter().rev() {
            if let Some(child) = nodes.get(child) {
                stack.push((depth + 1, child));
            }
        }
    }
    rows
}

fn phase_color(phase: NodePhase) -> Color {
    match phase {
        NodePhase::Succeeded => Color::Green,
        NodePhase::Failed | NodePhase::Error => Color::Red,
        NodePhase::Running | NodePhase::Pending => Color::Yellow,
        NodePhase::Skipped | NodePhase::Omitted => Color::DarkGrey,
    }
}

fn duration(node: &Node) -> String {
    match (node.started_at, node.finished_at) {
        (Some(start), Some(end)) => format!("{}s", (end - start).num_seconds()),
        _ => String::new(),
    }
}

pub fn print_workflow(workflow: &Workflow) {
    let color = match workflow.status.phase {
        WorkflowPhase::Succeeded => Color::Green,
        WorkflowPhase::Failed | WorkflowPhase::Error => Color::Red,
        _ => Color::Yellow,
    };

    println!();
    println!("  Name:    {}", workflow.key());
    println!("  Phase:   {}", workflow.status.phase);
    if !workflow.status.message.is_empty() {
        println!("  Message: {}", workflow.status.message);
    }
    println!();

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Step").fg(Color::White),
        Cell::new("Type").fg(Color::White),
        Cell::new("Phase").fg(color),
        Cell::new("Duration").fg(Color::White),
        Cell::new("Message").fg(Color::White),
    ]);
    for (depth, node) in tree_rows(workflow) {
        let indent = if depth == 0 {
            String::new()
        } else {
            format!("{}└ ", "  ".repeat(depth - 1))
        };
        table.add_row(vec![
            Cell::new(format!("{indent}{}", node.display_name)).fg(Color::Cyan),
            Cell::new(node.node_type.to_string()),
            Cell::new(node.phase.to_string()).fg(phase_color(node.phase)),
            Cell::new(duration(node)),
            Cell::new(&node.message).fg(Color::DarkGrey),
        ]);
    }
    println!("{table}");
}
