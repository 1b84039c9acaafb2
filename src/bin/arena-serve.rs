use anyhow::Result;

fn main() -> Result<()> {
    arenabox::cli::run(arenabox::cli::CliMode::Serve)
}
