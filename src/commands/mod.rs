mod plugin;

pub use plugin::{PluginCommand, plugin_command};
