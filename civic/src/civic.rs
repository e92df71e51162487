fn main() -> anyhow::Result<()> {
    civic_core::run()
}
