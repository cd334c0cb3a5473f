//! ---
//! ha_section: "02-status-sync-protocol"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Build script compiling the status sync protobuf definitions."
//! ha_version: "v0.1.0"
//! ha_owner: "tbd"
//! ---
fn main() {
    let protoc = protoc_bin_vendored::protoc_bin_path().expect("failed to locate protoc");
    std::env::set_var("PROTOC", protoc);

    println!("cargo:rerun-if-changed=proto/fleet/ha/v1/status_sync.proto");
    println!("cargo:rerun-if-changed=proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/fleet/ha/v1/status_sync.proto"], &["proto"])
        .expect("failed to compile gRPC definitions");
}
