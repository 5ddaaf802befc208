use tunman::app::Application;
use tunman::loader::ConfigurationLoader;

/// Example: load host definitions from a `conf.d/` directory and start
/// supervising every forwarding they declare.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tunman::init_logging()?;

    let hosts = ConfigurationLoader::new("./conf.d").load_all()?;

    println!("Loaded {} host configuration(s):", hosts.len());
    for host in &hosts {
        println!(
            "  {} with {} forwarding(s)",
            host.ident(),
            host.forward.len()
        );
    }

    let app = Application::new(hosts);

    println!("Starting tunnels... (Press Ctrl+C to stop)");
    let mut tasks = app.spawn_supervisors().await;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = async { while tasks.join_next().await.is_some() {} } => {}
    }

    app.close_all_tunnels().await;
    Ok(())
}
