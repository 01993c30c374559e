fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile with protox so no system `protoc` is needed
    let fds = protox::compile(["proto/calculator.proto"], ["proto/"])?;

    // Messages for the runner, server trait for the in-process test fixture
    tonic_build::configure()
        .build_client(false)
        .build_server(true)
        .compile_fds(fds)?;

    // Tell cargo to rerun if proto files change
    println!("cargo:rerun-if-changed=proto/calculator.proto");

    Ok(())
}
