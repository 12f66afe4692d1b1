use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    worldsync_lib::run().await
}
