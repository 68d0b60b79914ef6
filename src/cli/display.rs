use std::io::{self, Write};

use console::{Style, style};

use crate::gc::{GcApplySummary, GcReport};
use crate::issue::IssueRecord;
use crate::lifecycle::{resolve_record, WorkStatus};
use crate::mapping::WorktreeMapping;

/// One epic with everything the status view shows about it.
pub struct EpicView {
    pub epic: IssueRecord,
    pub mapping: Option<WorktreeMapping>,
    pub changesets: Vec<IssueRecord>,
}

pub struct Display;

impl Display {
    pub fn new() -> Self {
        Self
    }

    pub fn print_header(&self, text: &str) {
        println!();
        println!("{}", style(text).bold().cyan());
        println!("{}", style("═".repeat(60)).dim());
        println!();
    }

    pub fn print_epic_detail(&self, view: &EpicView) {
        self.print_header(&format!("Epic: {}", view.epic.id));

        let status = resolve_record(&view.epic).status;
        println!("Title:    {}", style(&view.epic.title).white().bold());
        println!(
            "Status:   {}",
            self.status_style(status).apply_to(status.to_string())
        );
        println!(
            "Assignee: {}",
            view.epic.assignee.as_deref().unwrap_or("-")
        );

        if let Some(mapping) = &view.mapping {
            println!("Root:     {}", mapping.root_branch);
            println!("Worktree: {}", mapping.worktree_path);
        }

        println!();
        if view.changesets.is_empty() {
            println!("{}", style("No changesets.").dim());
            return;
        }

        println!(
            "{:<12} {:<30} {:<12} {}",
            style("ID").bold(),
            style("Title").bold(),
            style("Status").bold(),
            style("Branch").bold()
        );
        println!("{}", style("─".repeat(70)).dim());

        for changeset in &view.changesets {
            let status = resolve_record(changeset).status;
            let branch = view
                .mapping
                .as_ref()
                .and_then(|m| m.changesets.get(&changeset.id).cloned())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<12} {:<30} {:<12} {}",
                changeset.id,
                truncate_chars(&changeset.title, 28),
                self.status_style(status).apply_to(status.to_string()),
                style(branch).dim()
            );
        }
    }

    pub fn print_epics_table(&self, views: &[EpicView]) {
        if views.is_empty() {
            println!("{}", style("No epics found.").dim());
            return;
        }

        let active = views
            .iter()
            .filter(|v| resolve_record(&v.epic).status == WorkStatus::InProgress)
            .count();
        let open = views
            .iter()
            .filter(|v| resolve_record(&v.epic).status == WorkStatus::Open)
            .count();
        let closed = views
            .iter()
            .filter(|v| resolve_record(&v.epic).status == WorkStatus::Closed)
            .count();

        println!(
            "In progress: {}  Open: {}  Closed: {}",
            style(active).yellow(),
            style(open).dim(),
            style(closed).green()
        );
        println!();

        println!(
            "{:<10} {:<30} {:<12} {:<12} {}",
            style("ID").bold(),
            style("Title").bold(),
            style("Status").bold(),
            style("Changesets").bold(),
            style("Root").bold()
        );
        println!("{}", style("─".repeat(80)).dim());

        for view in views {
            let status = resolve_record(&view.epic).status;
            let done = view
                .changesets
                .iter()
                .filter(|c| resolve_record(c).status == WorkStatus::Closed)
                .count();
            let root = view
                .mapping
                .as_ref()
                .map(|m| m.root_branch.clone())
                .unwrap_or_else(|| "-".to_string());

            println!(
                "{:<10} {:<30} {:<12} {:<12} {}",
                view.epic.id,
                truncate_chars(&view.epic.title, 28),
                self.status_style(status).apply_to(status.to_string()),
                format!("{}/{}", done, view.changesets.len()),
                style(root).dim()
            );
        }
    }

    pub fn print_gc_report(&self, report: &GcReport) {
        if report.actions.is_empty() {
            self.print_success("Nothing to reconcile.");
        } else {
            println!(
                "{}",
                style(format!("{} pending action(s):", report.actions.len())).bold()
            );
            for (i, action) in report.actions.iter().enumerate() {
                let marker = if action.is_destructive() {
                    style("!").red().bold()
                } else {
                    style("•").cyan()
                };
                println!("  {} [{}] {}", marker, i + 1, action.describe());
            }
        }

        for warning in &report.warnings {
            self.print_warning(warning);
        }
    }

    pub fn print_gc_summary(&self, summary: &GcApplySummary) {
        self.print_success(&format!("Applied {} action(s)", summary.applied));
        for (action, reason) in &summary.skipped {
            self.print_warning(&format!("skipped: {} ({})", action, reason));
        }
        for (action, error) in &summary.failures {
            self.print_error(&format!("failed: {} ({})", action, error));
        }
    }

    pub fn print_success(&self, message: &str) {
        println!("{} {}", style("✓").green().bold(), message);
    }

    pub fn print_error(&self, message: &str) {
        eprintln!("{} {}", style("✗").red().bold(), message);
    }

    pub fn print_warning(&self, message: &str) {
        println!("{} {}", style("!").yellow().bold(), message);
    }

    pub fn print_info(&self, message: &str) {
        println!("{} {}", style("→").cyan(), message);
    }

    /// y/N prompt; anything but an explicit yes declines.
    pub fn confirm(&self, prompt: &str) -> io::Result<bool> {
        print!("{} [y/N] ", style(prompt).cyan());
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        let answer = input.trim().to_lowercase();
        Ok(answer == "y" || answer == "yes")
    }

    fn status_style(&self, status: WorkStatus) -> Style {
        match status {
            WorkStatus::Open => Style::new().dim(),
            WorkStatus::InProgress => Style::new().yellow().bold(),
            WorkStatus::Blocked => Style::new().red(),
            WorkStatus::Deferred => Style::new().magenta(),
            WorkStatus::Closed => Style::new().green(),
        }
    }
}

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", truncated)
}
