//! Dependency graph reports.

use std::fmt::Write;

use epicflow_registry::{topological_order, RegistryResult, UnitStatus, WorkUnit};

fn by_id<'a>(all: &'a [WorkUnit], id: &str) -> Option<&'a WorkUnit> {
    all.iter().find(|u| u.id == id)
}

/// One line per unit in dependency order: id, status, title and blockers.
pub fn render_text(all: &[WorkUnit]) -> RegistryResult<String> {
    let mut out = String::new();
    for id in topological_order(all)? {
        let Some(unit) = by_id(all, &id) else { continue };
        let _ = write!(out, "{} [{}] {}", unit.id, unit.status, unit.title);
        if !unit.dependencies.blocked_by.is_empty() {
            let deps: Vec<&str> = unit
                .dependencies
                .blocked_by
                .iter()
                .map(String::as_str)
                .collect();
            let _ = write!(out, "  <- {}", deps.join(", "));
        }
        out.push('\n');
    }
    Ok(out)
}

fn fill(status: UnitStatus) -> &'static str {
    match status {
        UnitStatus::Defined => "white",
        UnitStatus::Prepared => "lightyellow",
        UnitStatus::Ready => "lightblue",
        UnitStatus::InProgress => "orange",
        UnitStatus::Implemented => "palegreen",
        UnitStatus::Archived => "lightgray",
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Graphviz DOT with edges from blocker to dependent.
pub fn render_dot(all: &[WorkUnit]) -> RegistryResult<String> {
    let order = topological_order(all)?;
    let mut out = String::from("digraph epics {\n  rankdir=LR;\n  node [shape=box, style=filled];\n");
    for id in &order {
        let Some(unit) = by_id(all, id) else { continue };
        let _ = writeln!(
            out,
            "  \"{}\" [label=\"{}\\n{}\\n({})\", fillcolor={}];",
            escape(&unit.id),
            escape(&unit.id),
            escape(&unit.title),
            unit.status,
            fill(unit.status)
        );
    }
    for id in &order {
        let Some(unit) = by_id(all, id) else { continue };
        for dep in &unit.dependencies.blocked_by {
            let _ = writeln!(out, "  \"{}\" -> \"{}\";", escape(dep), escape(&unit.id));
        }
    }
    out.push_str("}\n");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use epicflow_registry::fakes::MemoryRegistry;
    use epicflow_registry::{RegistryStore, UnitDraft, UnitMutation};

    fn sample() -> Vec<WorkUnit> {
        let reg = MemoryRegistry::new();
        reg.create(UnitDraft::new("Schema")).unwrap();
        reg.create(UnitDraft::new("API \"v2\"").blocked_by("EPIC-001")).unwrap();
        reg.update("EPIC-001", UnitMutation::Transition(UnitStatus::Prepared))
            .unwrap();
        reg.all().unwrap()
    }

    #[test]
    fn text_lists_units_in_dependency_order() {
        let text = render_text(&sample()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "EPIC-001 [prepared] Schema");
        assert_eq!(lines[1], "EPIC-002 [defined] API \"v2\"  <- EPIC-001");
    }

    #[test]
    fn dot_has_nodes_and_edges() {
        let dot = render_dot(&sample()).unwrap();
        assert!(dot.starts_with("digraph epics {"));
        assert!(dot.contains("\"EPIC-001\" -> \"EPIC-002\";"));
        assert!(dot.contains("API \\\"v2\\\""));
        assert!(dot.trim_end().ends_with('}'));
    }
}
