//! Standalone worker host. The pool spawns this binary (or `sail
//! worker-host`) once per worker and feeds it jobs over stdin.

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    sail_workers::host::run().await
}
