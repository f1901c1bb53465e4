//! Demonstration tools for steploop.
//!
//! Small, side-effect free tools used by the CLI replay command and by tests:
//! order lookup with a randomized body, a weather stub, and arithmetic.

pub mod arithmetic;
pub mod find_orders;
pub mod weather_lookup;

use steploop_core::error::RegistryError;
use steploop_core::tool::ToolRegistry;

pub use arithmetic::{AddTool, MultiplyTool};
pub use find_orders::{FIND_ORDERS, FindOrdersTool, deferred_find_orders, find_orders_shape};
pub use weather_lookup::GetWeatherTool;

/// Create a registry with every executable demo tool.
///
/// `seed` makes the randomized `findOrders` tool reproducible.
pub fn default_registry(seed: Option<u64>) -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();
    registry.register_tool(Box::new(FindOrdersTool::new(seed)))?;
    registry.register_tool(Box::new(GetWeatherTool))?;
    registry.register_tool(Box::new(AddTool))?;
    registry.register_tool(Box::new(MultiplyTool))?;
    Ok(registry)
}

/// Like [`default_registry`], but `findOrders` has no executor: its calls are
/// handed back to the caller.
pub fn registry_with_deferred_orders() -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();
    registry.register(deferred_find_orders())?;
    registry.register_tool(Box::new(GetWeatherTool))?;
    registry.register_tool(Box::new(AddTool))?;
    registry.register_tool(Box::new(MultiplyTool))?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_all_tools() {
        let registry = default_registry(Some(0)).unwrap();
        assert_eq!(
            registry.names(),
            vec!["add", "findOrders", "getWeather", "multiply"]
        );
        assert!(registry.resolve("findOrders").unwrap().has_executor());
    }

    #[test]
    fn deferred_registry_has_bodiless_orders() {
        let registry = registry_with_deferred_orders().unwrap();
        assert_eq!(registry.len(), 4);
        assert!(!registry.resolve("findOrders").unwrap().has_executor());
        assert!(registry.resolve("add").unwrap().has_executor());
    }
}
