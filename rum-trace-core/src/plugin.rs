//! Plugin registry
//!
//! Plugins extend the agent through a fixed set of lifecycle hooks. Each plugin
//! enumerates the hooks it implements; the registry only calls those, in
//! registration order.

use crate::agent::AgentContext;
use std::fmt;
use std::rc::Rc;

/// Lifecycle hooks a plugin can take part in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginHook {
    /// Synchronous init during bootstrap
    Init,
    /// Deferred init, scheduled after bootstrap
    AsyncInit,
    /// Page is about to unload
    BeforeUnload,
}

impl fmt::Display for PluginHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginHook::Init => write!(f, "init"),
            PluginHook::AsyncInit => write!(f, "asyncInit"),
            PluginHook::BeforeUnload => write!(f, "beforeUnload"),
        }
    }
}

/// An agent extension
pub trait Plugin {
    /// Unique plugin name
    fn name(&self) -> &str;

    /// Hooks this plugin implements
    fn hooks(&self) -> &'static [PluginHook];

    fn init(&self, _ctx: &AgentContext) {}

    fn async_init(&self, _ctx: &AgentContext) {}

    fn before_unload(&self, _ctx: &AgentContext) {}
}

/// Ordered set of plugins
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Rc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin; returns false if a plugin with that name is registered
    pub fn register(&mut self, plugin: Rc<dyn Plugin>) -> bool {
        if self.plugins.iter().any(|p| p.name() == plugin.name()) {
            log::warn!("Plugin {} already registered, ignoring", plugin.name());
            return false;
        }
        log::debug!("Registered plugin {} (hooks: {:?})", plugin.name(), plugin.hooks());
        self.plugins.push(plugin);
        true
    }

    pub fn plugins(&self) -> &[Rc<dyn Plugin>] {
        &self.plugins
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Plugins implementing `hook`, in registration order
    pub fn with_hook(&self, hook: PluginHook) -> Vec<Rc<dyn Plugin>> {
        self.plugins
            .iter()
            .filter(|p| p.hooks().contains(&hook))
            .cloned()
            .collect()
    }
}

/// Call `hook` on every plugin in `plugins`
pub fn run_hook(plugins: &[Rc<dyn Plugin>], hook: PluginHook, ctx: &AgentContext) {
    for plugin in plugins {
        log::trace!("Running {} of plugin {}", hook, plugin.name());
        match hook {
            PluginHook::Init => plugin.init(ctx),
            PluginHook::AsyncInit => plugin.async_init(ctx),
            PluginHook::BeforeUnload => plugin.before_unload(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, &'static [PluginHook]);

    impl Plugin for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn hooks(&self) -> &'static [PluginHook] {
            self.1
        }
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut registry = PluginRegistry::new();
        assert!(registry.register(Rc::new(Named("nav", &[PluginHook::Init]))));
        assert!(!registry.register(Rc::new(Named("nav", &[]))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_with_hook_keeps_registration_order() {
        let mut registry = PluginRegistry::new();
        registry.register(Rc::new(Named("a", &[PluginHook::Init, PluginHook::BeforeUnload])));
        registry.register(Rc::new(Named("b", &[PluginHook::AsyncInit])));
        registry.register(Rc::new(Named("c", &[PluginHook::BeforeUnload])));

        let unload: Vec<String> = registry
            .with_hook(PluginHook::BeforeUnload)
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(unload, vec!["a", "c"]);
        assert_eq!(registry.names(), vec!["a", "b", "c"]);
    }
}
