fn builder() -> tonic_build::Builder {
    tonic_build::configure()
        .format(false)
        .build_client(true)
        .build_server(true)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/deviceplugin/v1beta1/deviceplugin.proto");
    println!("cargo:rerun-if-changed=proto/pluginregistration/v1/pluginregistration.proto");

    // Served to the kubelet. The clients dial our own sockets and the kubelet registration socket
    builder().compile(
        &["proto/deviceplugin/v1beta1/deviceplugin.proto"],
        &["proto/deviceplugin/v1beta1"],
    )?;

    // Served in plugin watcher mode
    builder().compile(
        &["proto/pluginregistration/v1/pluginregistration.proto"],
        &["proto/pluginregistration/v1"],
    )?;

    Ok(())
}
