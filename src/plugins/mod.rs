//! Plugins shipped with the controller.

mod auto_rcon;
mod infinity_light;
mod player_find;
mod run_cmd;
mod tp;
mod tsday;

pub use auto_rcon::AutoConnectRcon;
pub use infinity_light::InfinityLight;
pub use player_find::{find_players, FindMode, PlayerFindHelper};
pub use run_cmd::RunCmd;
pub use tp::TeleportPlugin;
pub use tsday::TsDay;
