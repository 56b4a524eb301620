use anyhow::{bail, Context, Result};
use std::io::{self, BufRead, IsTerminal, Write};

/// Asks the operator to confirm a write run. `assume_yes` skips the prompt.
pub fn confirm(prompt: &str, assume_yes: bool) -> Result<()> {
    if assume_yes {
        return Ok(());
    }
    if !io::stdin().is_terminal() {
        bail!(
            "{} Non-interactive session detected; pass --yes to proceed.",
            prompt
        );
    }

    let mut stderr = io::stderr();
    write!(stderr, "{} [y/N] ", prompt).context("failed to write confirmation prompt")?;
    stderr.flush().context("failed to flush confirmation prompt")?;

    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    if is_affirmative(&answer) {
        Ok(())
    } else {
        bail!("Aborted by operator")
    }
}

fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
