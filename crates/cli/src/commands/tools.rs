//! `steploop tools`: list the demo tools.

use steploop_tools::default_registry;

pub fn run() -> anyhow::Result<()> {
    let registry = default_registry(None)?;
    println!("{} tools registered\n", registry.len());
    for decl in registry.declarations() {
        println!("{}: {}", decl.name, decl.description);
        println!("{}\n", serde_json::to_string_pretty(&decl.parameters)?);
    }
    Ok(())
}
