//! Walks through the host facade end to end against a scratch plugin root:
//! write a descriptor and settings by hand (standing in for an installed
//! mod-listing plugin), boot a `PluginHost` from a TOML `HostConfig`,
//! inspect the integrity registry, then tear it down.

use pluginhost::{HostConfig, PluginHost};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let root = std::env::temp_dir().join("pluginhost-demo");
    std::fs::create_dir_all(&root)?;
    println!("=== pluginhost demo ===\n");
    println!("plugin root: {:?}", root);

    let plugin_directory = root.join("example-plugin");
    std::fs::create_dir_all(&plugin_directory)?;
    std::fs::write(
        plugin_directory.join("plugin.json"),
        serde_json::json!({
            "pluginId": "example-plugin",
            "displayName": "Example Plugin",
            "description": "Demo-only descriptor, no real code object behind it",
            "author": "pluginhost",
            "version": "1.0.0",
            "assemblyName": "example_plugin.so",
            "mainClass": "ExamplePlugin",
        })
        .to_string(),
    )?;

    let config_path = root.join("host.toml");
    let config = HostConfig::load_or_default(&config_path, &root)?;
    config.save(&config_path)?;
    println!("host config written to {:?}", config_path);

    let host = PluginHost::from_config(config);

    // No real code object on disk, so this plugin fails integrity or load
    // and is logged rather than loaded; that's the point of the demo --
    // the facade never panics on a bad plugin directory.
    host.initialize().await;
    println!("loaded plugins: {:?}", host.get_all());

    println!("\nintegrity record:");
    if let Some(record) = host.integrity().get("example-plugin") {
        println!("  status: {:?}", record.status);
        println!("  content hash: {}", record.code_object_hash);
    }

    let mods = host.get_all_recent_mods().await;
    println!("\nrecent mods across all loaded plugins: {}", mods.len());

    let deleted = host.safe_delete("example-plugin", None).await;
    println!("\nsafe_delete(\"example-plugin\") -> {}", deleted);

    host.shutdown().await;
    std::fs::remove_dir_all(&root).ok();

    Ok(())
}
