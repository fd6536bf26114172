use std::env;
use std::path::PathBuf;

fn main() {
    let manifest_dir =
        PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set"));

    let proto_dir = manifest_dir.join("proto");
    let proto_src = proto_dir.join("traffic.proto");

    // Use the vendored protoc unless the caller pinned one explicitly.
    if env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()
            .expect("no vendored protoc available for this host");
        env::set_var("PROTOC", protoc);
    }

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(&[proto_src], &[proto_dir])
        .unwrap_or_else(|e| {
            eprintln!("protobuf compilation failed: {e}");
            std::process::exit(1);
        });

    // Tell cargo to rerun if the protocol definition changes.
    println!("cargo:rerun-if-changed=proto/");
    println!("cargo:rerun-if-changed=build.rs");
}
