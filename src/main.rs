fn main() -> std::process::ExitCode {
    echonote_store::run()
}
