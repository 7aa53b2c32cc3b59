//! Smart home command types and device-state bookkeeping
//!
//! Commands are the only data that leaves the process (via the command
//! transport), so their shape is validated here: unknown device kinds are
//! rejected at deserialization, before a command can reach the broker.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of device a command targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Room light
    Light,
    /// Air conditioner
    Ac,
    /// Window actuator
    Window,
    /// Temperature probe (read-only, no switch state)
    Temperature,
}

impl DeviceKind {
    /// All supported device kinds
    pub const ALL: [Self; 4] = [Self::Light, Self::Ac, Self::Window, Self::Temperature];

    /// Human-readable device name used in spoken replies and summaries
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Light => "灯",
            Self::Ac => "空调",
            Self::Window => "窗户",
            Self::Temperature => "温度",
        }
    }
}

/// A recognized device command
///
/// Serializes to the wire shape consumed by device processes, e.g.
/// `{"type":"ac","device":"空调","action":"开"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Device kind (`type` on the wire)
    #[serde(rename = "type")]
    pub kind: DeviceKind,

    /// Spoken device name, may be empty (e.g. temperature checks)
    #[serde(default)]
    pub device: String,

    /// Requested action ("开", "关", "检测")
    #[serde(default)]
    pub action: String,

    /// Stamped when the command is dispatched, absent before that
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Command {
    /// Create a command without a dispatch timestamp
    #[must_use]
    pub fn new(kind: DeviceKind, device: &str, action: &str) -> Self {
        Self {
            kind,
            device: device.to_string(),
            action: action.to_string(),
            timestamp: None,
        }
    }

    /// Return this command stamped with the current time
    #[must_use]
    pub fn stamped(mut self) -> Self {
        self.timestamp = Some(Utc::now());
        self
    }

    /// Format the command as a short spoken phrase ("开空调", "执行温度检测")
    #[must_use]
    pub fn describe(&self) -> String {
        if self.kind == DeviceKind::Temperature {
            return "执行温度检测".to_string();
        }
        let device = if self.device.is_empty() {
            self.kind.display_name()
        } else {
            &self.device
        };
        format!("{}{device}", self.action)
    }
}

/// A command the model inferred but is not certain about
///
/// Carried alongside concrete commands so the assistant can ask back
/// ("为您打开空调？") instead of acting on a guess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedCommand {
    /// Device kind (`type` on the wire)
    #[serde(rename = "type")]
    pub kind: DeviceKind,

    /// Suggested action
    #[serde(default)]
    pub action: String,

    /// Question to ask the user, if the model provided one
    #[serde(default)]
    pub suggestion: String,
}

/// On/off position of a switchable device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    /// Powered on (light, ac)
    On,
    /// Powered off (light, ac)
    Off,
    /// Open (window)
    Open,
    /// Closed (window)
    Closed,
}

impl SwitchState {
    /// Human-readable state used in summaries
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::On => "开启",
            Self::Off => "关闭",
            Self::Open => "打开",
            Self::Closed => "关闭",
        }
    }
}

/// Record for one switchable device
#[derive(Debug, Clone)]
struct SwitchRecord {
    state: SwitchState,
    last_action: Option<String>,
    last_update: Option<DateTime<Utc>>,
}

/// Tracks the assumed state of every controllable device
///
/// State is re-applied blindly on every command: delivery downstream is
/// at-least-once, so applying the same command twice must be harmless.
#[derive(Debug, Clone)]
pub struct DeviceStore {
    switches: HashMap<DeviceKind, SwitchRecord>,
    temperature_checked: Option<DateTime<Utc>>,
    temperature_value: Option<String>,
}

impl Default for DeviceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStore {
    /// Create a store with every switch off/closed and no temperature reading
    #[must_use]
    pub fn new() -> Self {
        let mut switches = HashMap::new();
        for kind in [DeviceKind::Light, DeviceKind::Ac, DeviceKind::Window] {
            let state = if kind == DeviceKind::Window {
                SwitchState::Closed
            } else {
                SwitchState::Off
            };
            switches.insert(
                kind,
                SwitchRecord {
                    state,
                    last_action: None,
                    last_update: None,
                },
            );
        }
        Self {
            switches,
            temperature_checked: None,
            temperature_value: None,
        }
    }

    /// Apply a dispatched command to the tracked state
    pub fn apply(&mut self, command: &Command) {
        let now = Utc::now();

        if command.kind == DeviceKind::Temperature {
            // A temperature check doesn't flip anything, just record it
            self.temperature_checked = Some(now);
            return;
        }

        let Some(record) = self.switches.get_mut(&command.kind) else {
            return;
        };

        match command.action.as_str() {
            "开" => {
                record.state = if command.kind == DeviceKind::Window {
                    SwitchState::Open
                } else {
                    SwitchState::On
                };
            }
            "关" => {
                record.state = if command.kind == DeviceKind::Window {
                    SwitchState::Closed
                } else {
                    SwitchState::Off
                };
            }
            _ => {}
        }

        record.last_action = Some(command.action.clone());
        record.last_update = Some(now);
    }

    /// Current state of a switchable device, `None` for temperature
    #[must_use]
    pub fn switch_state(&self, kind: DeviceKind) -> Option<SwitchState> {
        self.switches.get(&kind).map(|r| r.state)
    }

    /// Record an observed temperature value (from a device reply)
    pub fn set_temperature_value(&mut self, value: &str) {
        self.temperature_value = Some(value.to_string());
    }

    /// Format a state summary for model prompts
    #[must_use]
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();

        for kind in [DeviceKind::Light, DeviceKind::Ac, DeviceKind::Window] {
            if let Some(record) = self.switches.get(&kind) {
                let last_action = record.last_action.as_deref().unwrap_or("无");
                lines.push(format!(
                    "{}：{}（最后操作：{last_action}）",
                    kind.display_name(),
                    record.state.describe()
                ));
            }
        }

        if let Some(checked) = self.temperature_checked {
            let value = self.temperature_value.as_deref().unwrap_or("未知");
            lines.push(format!(
                "温度：最后检查时间 {}，值 {value}",
                checked.to_rfc3339()
            ));
        }

        if lines.is_empty() {
            "暂无设备状态信息".to_string()
        } else {
            lines.join("\n")
        }
    }

    /// The device updated most recently, used for pronoun resolution
    #[must_use]
    pub fn recently_operated(&self) -> Option<DeviceKind> {
        let mut best: Option<(DeviceKind, DateTime<Utc>)> = None;

        for (kind, record) in &self.switches {
            if let Some(updated) = record.last_update {
                if best.is_none_or(|(_, t)| updated > t) {
                    best = Some((*kind, updated));
                }
            }
        }
        if let Some(checked) = self.temperature_checked {
            if best.is_none_or(|(_, t)| checked > t) {
                best = Some((DeviceKind::Temperature, checked));
            }
        }

        best.map(|(kind, _)| kind)
    }
}
