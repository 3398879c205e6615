//! Turns a plan document or a lead-AI response into a dependency-ordered
//! task graph (spec.md 4.7 "Decompose").

use crate::models::{Priority, Task};
use std::collections::HashMap;

/// Parses `- [ ]` checklist lines from a Markdown plan, grouped by `##`
/// headings (the heading becomes each task's `category`).
pub fn parse_plan_markdown(markdown: &str) -> Vec<Task> {
    let mut tasks = Vec::new();
    let mut current_category: Option<String> = None;
    let mut next_id = 1;

    for line in markdown.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix("## ") {
            current_category = Some(heading.trim().to_string());
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("- [ ]") {
            let title = rest.trim().to_string();
            if title.is_empty() {
                continue;
            }
            let id = format!("task-{next_id}");
            next_id += 1;
            let mut task = Task::new(id, title.clone(), title);
            task.category = current_category.clone();
            task.source_line = Some(line.to_string());
            tasks.push(task);
        }
    }

    tasks
}

/// One entry of a `---TEAM_TASKS---` block emitted by the lead AI.
#[derive(Debug, Clone, Default)]
struct RawTeamTask {
    title: String,
    description: String,
    priority: Option<String>,
    depends_on_titles: Vec<String>,
    files: Vec<String>,
}

/// Parses a `---TEAM_TASKS---` block whose entries carry
/// `TASK/DESCRIPTION/PRIORITY/DEPENDS_ON/FILES` fields, resolves
/// title-based dependencies to stable sequential IDs (exact match, else
/// case-insensitive substring match), and logs+drops unresolved deps.
pub fn parse_team_tasks_block(response: &str) -> Vec<Task> {
    let Some(block_start) = response.find("---TEAM_TASKS---") else {
        return Vec::new();
    };
    let body = &response[block_start + "---TEAM_TASKS---".len()..];
    let body = match body.find("---END_TASKS---") {
        Some(end) => &body[..end],
        None => body,
    };

    let mut raw_tasks = Vec::new();
    let mut current: Option<RawTeamTask> = None;

    for line in body.lines() {
        let trimmed = line.trim().trim_start_matches('-').trim_start();
        if let Some(value) = trimmed.strip_prefix("TASK:") {
            if let Some(task) = current.take() {
                raw_tasks.push(task);
            }
            current = Some(RawTeamTask {
                title: value.trim().to_string(),
                ..Default::default()
            });
        } else if let Some(value) = trimmed.strip_prefix("DESCRIPTION:") {
            if let Some(task) = current.as_mut() {
                task.description = value.trim().to_string();
            }
        } else if let Some(value) = trimmed.strip_prefix("PRIORITY:") {
            if let Some(task) = current.as_mut() {
                task.priority = Some(value.trim().to_lowercase());
            }
        } else if let Some(value) = trimmed.strip_prefix("DEPENDS_ON:") {
            if let Some(task) = current.as_mut() {
                task.depends_on_titles = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("none"))
                    .collect();
            }
        } else if let Some(value) = trimmed.strip_prefix("FILES:") {
            if let Some(task) = current.as_mut() {
                task.files = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
        }
    }
    if let Some(task) = current.take() {
        raw_tasks.push(task);
    }

    let mut title_to_id: HashMap<String, String> = HashMap::new();
    for (index, raw) in raw_tasks.iter().enumerate() {
        title_to_id.insert(raw.title.to_lowercase(), format!("task-{}", index + 1));
    }

    raw_tasks
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            let id = format!("task-{}", index + 1);
            let mut task = Task::new(id, raw.title, raw.description);
            task.priority = parse_priority(raw.priority.as_deref());
            task.files = raw.files;
            task.depends_on = raw
                .depends_on_titles
                .iter()
                .filter_map(|title| resolve_dependency(title, &title_to_id))
                .collect();
            task
        })
        .collect()
}

fn parse_priority(value: Option<&str>) -> Priority {
    match value {
        Some("critical") => Priority::Critical,
        Some("high") => Priority::High,
        Some("low") => Priority::Low,
        _ => Priority::Normal,
    }
}

fn resolve_dependency(title: &str, title_to_id: &HashMap<String, String>) -> Option<String> {
    let needle = title.to_lowercase();
    if let Some(id) = title_to_id.get(&needle) {
        return Some(id.clone());
    }
    let fuzzy = title_to_id
        .iter()
        .find(|(known_title, _)| known_title.contains(&needle) || needle.contains(known_title.as_str()));
    match fuzzy {
        Some((_, id)) => Some(id.clone()),
        None => {
            tracing::warn!(dependency = %title, "could not resolve task dependency by title, dropping");
            None
        }
    }
}

/// Disposition the lead AI chooses for a failed task (spec.md 6's
/// "Failed-task decision protocol", lead-driven mode).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadDecision {
    pub action: String,
    pub task_id: String,
    pub reason: String,
}

/// Renders a `---LEAD_DECISION---` block in the exact shape spec.md 6
/// defines it, the inverse of [`parse_lead_decision`].
pub fn format_lead_decision(decision: &LeadDecision) -> String {
    format!(
        "---LEAD_DECISION---\nACTION: {}\nTASK_ID: {}\nREASON: {}\n---END_DECISION---",
        decision.action, decision.task_id, decision.reason
    )
}

/// Parses a `---LEAD_DECISION---` block. Returns `None` if the block is
/// absent or missing its `ACTION`/`TASK_ID` fields.
pub fn parse_lead_decision(response: &str) -> Option<LeadDecision> {
    let block_start = response.find("---LEAD_DECISION---")?;
    let body = &response[block_start + "---LEAD_DECISION---".len()..];
    let body = match body.find("---END_DECISION---") {
        Some(end) => &body[..end],
        None => body,
    };

    let mut action = None;
    let mut task_id = None;
    let mut reason = String::new();

    for line in body.lines() {
        let trimmed = line.trim();
        if let Some(value) = trimmed.strip_prefix("ACTION:") {
            action = Some(value.trim().to_lowercase());
        } else if let Some(value) = trimmed.strip_prefix("TASK_ID:") {
            task_id = Some(value.trim().to_string());
        } else if let Some(value) = trimmed.strip_prefix("REASON:") {
            reason = value.trim().to_string();
        }
    }

    Some(LeadDecision {
        action: action?,
        task_id: task_id?,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_checklist_grouped_by_heading() {
        let markdown = "## Backend\n- [ ] Add auth middleware\n- [ ] Write tests\n\n## Frontend\n- [ ] Build login page\n";
        let tasks = parse_plan_markdown(markdown);
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].category, Some("Backend".to_string()));
        assert_eq!(tasks[2].category, Some("Frontend".to_string()));
        assert_eq!(tasks[0].title, "Add auth middleware");
    }

    #[test]
    fn ignores_checked_and_non_checklist_lines() {
        let markdown = "- [x] already done\nsome prose\n- [ ] real task\n";
        let tasks = parse_plan_markdown(markdown);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "real task");
    }

    #[test]
    fn team_tasks_block_resolves_exact_title_dependency() {
        let response = "---TEAM_TASKS---\n- TASK: Set up database\n  DESCRIPTION: create schema\n  PRIORITY: high\n  DEPENDS_ON: none\n- TASK: Add API endpoint\n  DESCRIPTION: expose schema\n  DEPENDS_ON: Set up database\n---END_TASKS---";
        let tasks = parse_team_tasks_block(response);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].depends_on, vec!["task-1".to_string()]);
        assert_eq!(tasks[0].priority, Priority::High);
        assert!(tasks[0].depends_on.is_empty());
    }

    #[test]
    fn unresolved_dependency_is_dropped_not_errored() {
        let response = "---TEAM_TASKS---\n- TASK: Only task\n  DESCRIPTION: d\n  DEPENDS_ON: Nonexistent task\n---END_TASKS---";
        let tasks = parse_team_tasks_block(response);
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].depends_on.is_empty());
    }

    #[test]
    fn fuzzy_substring_match_resolves_dependency() {
        let response = "---TEAM_TASKS---\n- TASK: Implement user authentication flow\n  DESCRIPTION: d\n- TASK: Write login tests\n  DESCRIPTION: d\n  DEPENDS_ON: authentication\n---END_TASKS---";
        let tasks = parse_team_tasks_block(response);
        assert_eq!(tasks[1].depends_on, vec!["task-1".to_string()]);
    }

    #[test]
    fn lead_decision_round_trips_through_format_and_parse() {
        let decision = LeadDecision {
            action: "retry_task".to_string(),
            task_id: "task-3".to_string(),
            reason: "transient verify failure".to_string(),
        };
        let rendered = format_lead_decision(&decision);
        assert_eq!(parse_lead_decision(&rendered), Some(decision));
    }

    #[test]
    fn parse_lead_decision_reads_embedded_block() {
        let response = "Here is my decision:\n---LEAD_DECISION---\nACTION: skip_task\nTASK_ID: task-7\nREASON: superseded by task-9\n---END_DECISION---\nthanks";
        let decision = parse_lead_decision(response).unwrap();
        assert_eq!(decision.action, "skip_task");
        assert_eq!(decision.task_id, "task-7");
        assert_eq!(decision.reason, "superseded by task-9");
    }

    #[test]
    fn parse_lead_decision_returns_none_without_block() {
        assert!(parse_lead_decision("no decision here").is_none());
    }
}
