use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(out_dir.join("base_v1_descriptor.bin"))
        // The gateway renders these messages as JSON with their proto field names.
        .message_attribute(
            ".",
            "#[derive(serde::Serialize, serde::Deserialize)]\n#[serde(default)]",
        )
        .field_attribute(
            "base.v1.PermissionCheckResponse.can",
            "#[serde(with = \"crate::gateway::json::check_result\")]",
        )
        .field_attribute(
            "base.v1.DataChange.operation",
            "#[serde(with = \"crate::gateway::json::data_change_operation\")]",
        )
        .compile_protos(&["proto/base/v1/service.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/base/v1/service.proto");

    Ok(())
}
