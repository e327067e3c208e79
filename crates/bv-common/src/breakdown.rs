//! Breakdown templates: reusable scope trees that seed matcher buckets.

use crate::error::PipelineError;
use crate::model::{BreakdownOption, BreakdownTemplate, ScopeNode};

pub const MAX_DEPTH: usize = 4;

fn leaf_count(nodes: &[ScopeNode]) -> usize {
    nodes
        .iter()
        .map(|node| {
            if node.children.is_empty() {
                1
            } else {
                leaf_count(&node.children)
            }
        })
        .sum()
}

/// Listing view for a trade: most used first, then by name.
pub fn options(templates: &[BreakdownTemplate]) -> Vec<BreakdownOption> {
    let mut options: Vec<BreakdownOption> = templates
        .iter()
        .map(|template| BreakdownOption {
            template_id: template.id,
            name: template.name.clone(),
            leaf_count: leaf_count(&template.nodes),
            use_count: template.use_count,
        })
        .collect();
    options.sort_by(|a, b| {
        b.use_count
            .cmp(&a.use_count)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
    options
}

fn check_nodes(nodes: &[ScopeNode], depth: usize, path: &str) -> Result<(), PipelineError> {
    for node in nodes {
        if node.name.trim().is_empty() {
            return Err(PipelineError::validation(format!(
                "breakdown node under \"{path}\" has an empty name"
            )));
        }
        if depth > MAX_DEPTH {
            return Err(PipelineError::validation(format!(
                "breakdown node \"{}\" is deeper than {MAX_DEPTH} levels",
                node.name.trim()
            )));
        }
        check_nodes(&node.children, depth + 1, node.name.trim())?;
    }
    Ok(())
}

pub fn validate(template: &BreakdownTemplate) -> Result<(), PipelineError> {
    if template.name.trim().is_empty() {
        return Err(PipelineError::validation("breakdown template name is empty"));
    }
    if template.nodes.is_empty() {
        return Err(PipelineError::validation("breakdown template has no scope nodes"));
    }
    check_nodes(&template.nodes, 1, template.name.trim())
}

fn collect_leaves(nodes: &[ScopeNode], prefix: &mut Vec<String>, out: &mut Vec<String>) {
    for node in nodes {
        prefix.push(node.name.trim().to_string());
        if node.children.is_empty() {
            out.push(prefix.join(" > "));
        } else {
            collect_leaves(&node.children, prefix, out);
        }
        prefix.pop();
    }
}

/// Leaf paths in tree order, e.g. `Flooring > Demolition`.
pub fn seed_labels(template: &BreakdownTemplate) -> Vec<String> {
    let mut out = Vec::new();
    collect_leaves(&template.nodes, &mut Vec::new(), &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn node(name: &str, children: Vec<ScopeNode>) -> ScopeNode {
        ScopeNode {
            name: name.into(),
            children,
        }
    }

    fn template(name: &str, use_count: i64, nodes: Vec<ScopeNode>) -> BreakdownTemplate {
        BreakdownTemplate {
            id: Uuid::new_v4(),
            trade_type: "flooring".into(),
            name: name.into(),
            nodes,
            use_count,
        }
    }

    #[test]
    fn leaves_flatten_to_paths_in_order() {
        let t = template(
            "Flooring",
            0,
            vec![
                node(
                    "Flooring",
                    vec![ScopeNode::leaf("Demolition"), ScopeNode::leaf("Prep")],
                ),
                ScopeNode::leaf("Cleanup"),
            ],
        );
        assert_eq!(
            seed_labels(&t),
            vec!["Flooring > Demolition", "Flooring > Prep", "Cleanup"]
        );
    }

    #[test]
    fn options_sort_by_use_then_name() {
        let templates = vec![
            template("b basic", 2, vec![ScopeNode::leaf("x")]),
            template("A detailed", 2, vec![node("p", vec![ScopeNode::leaf("x"), ScopeNode::leaf("y")])]),
            template("popular", 9, vec![ScopeNode::leaf("x")]),
        ];
        let listed = options(&templates);
        let names: Vec<&str> = listed.iter().map(|option| option.name.as_str()).collect();
        assert_eq!(names, vec!["popular", "A detailed", "b basic"]);
        assert_eq!(listed[1].leaf_count, 2);
    }

    #[test]
    fn depth_and_names_are_validated() {
        let ok = template(
            "Deep",
            0,
            vec![node("1", vec![node("2", vec![node("3", vec![ScopeNode::leaf("4")])])])],
        );
        assert!(validate(&ok).is_ok());

        let too_deep = template(
            "Deeper",
            0,
            vec![node("1", vec![node("2", vec![node("3", vec![node("4", vec![ScopeNode::leaf("5")])])])])],
        );
        assert!(matches!(validate(&too_deep), Err(PipelineError::Validation(_))));

        let blank = template("Blank", 0, vec![node("Floor", vec![ScopeNode::leaf(" ")])]);
        assert!(matches!(validate(&blank), Err(PipelineError::Validation(_))));
        assert!(validate(&template("Empty", 0, vec![])).is_err());
    }
}
