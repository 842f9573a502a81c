fn main() -> anyhow::Result<()> {
    factflow::run()?;
    Ok(())
}
