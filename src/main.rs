use anyhow::Result;
use env_logger::Env;

use shoeclassifier::{ run, Config };


fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    println!("");
    println!("===================================");
    println!("=== Training shoe classifier    ===");
    println!("===================================");

    let report = run(&Config::default())?;
    for (key, value) in report.properties.iter() {
        println!("{}: {}", key, value);
    }
    println!("Saved {:?}", report.manifest);
    Ok(())
}
