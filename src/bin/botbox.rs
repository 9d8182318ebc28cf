use anyhow::Result;

fn main() -> Result<()> {
    botbox::cli::run()
}
