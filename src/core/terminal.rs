use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

/// Titled block of aligned rows for help and status screens.
pub struct GuideSection {
    title: String,
    rows: Vec<GuideRow>,
}

enum GuideRow {
    Command(String, String),
    Status(String, String),
    Text(String),
    Blank,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.rows
            .push(GuideRow::Command(name.to_string(), description.to_string()));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.rows
            .push(GuideRow::Status(label.to_string(), value.to_string()));
        self
    }

    pub fn text(mut self, line: &str) -> Self {
        self.rows.push(GuideRow::Text(line.to_string()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.rows.push(GuideRow::Blank);
        self
    }

    pub fn print(&self) {
        println!("\n {}", style(&self.title).bold().underlined());
        let width = self
            .rows
            .iter()
            .filter_map(|row| match row {
                GuideRow::Command(name, _) => Some(name.len()),
                _ => None,
            })
            .max()
            .unwrap_or(0);

        for row in &self.rows {
            match row {
                GuideRow::Command(name, description) => println!(
                    "   {}  {}",
                    style(format!("{:<width$}", name, width = width)).green(),
                    description
                ),
                GuideRow::Status(label, value) => print_status(label, value),
                GuideRow::Text(line) => println!("   {}", line),
                GuideRow::Blank => println!(),
            }
        }
    }
}

pub fn print_banner() {
    println!();
    println!(
        "{} {}",
        style("actions-witness").bold().cyan(),
        style(env!("CARGO_PKG_VERSION")).dim()
    );
    println!(
        "{}",
        style("Workflow run records, every attempt, every line.").cyan()
    );
}

pub fn print_goodbye() {
    println!("\n{} {}", SPARKLE, style("Stopped.").bold().cyan());
}
