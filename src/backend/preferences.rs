use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::config_dir;

/// Density-independent pixels covered by one terminal cell.
pub const DP_PER_CELL: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Down,
    Left,
    Right,
    Up,
}

impl Direction {
    pub fn is_horizontal(self) -> bool {
        matches!(self, Direction::Left | Direction::Right)
    }

    pub fn next(self) -> Self {
        match self {
            Direction::Down => Direction::Left,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Up,
            Direction::Up => Direction::Down,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Direction::Down => "Top to bottom",
            Direction::Left => "Right to left",
            Direction::Right => "Left to right",
            Direction::Up => "Bottom to top",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ImageScale {
    #[default]
    FitScreen,
    Stretch,
    FitWidth,
    FitHeight,
    OriginalSize,
    SmartFit,
}

impl ImageScale {
    const ALL: [ImageScale; 6] = [
        ImageScale::FitScreen,
        ImageScale::Stretch,
        ImageScale::FitWidth,
        ImageScale::FitHeight,
        ImageScale::OriginalSize,
        ImageScale::SmartFit,
    ];

    pub fn next(self) -> Self {
        let index = Self::ALL.iter().position(|s| *s == self).unwrap_or(0);
        Self::ALL[(index + 1) % Self::ALL.len()]
    }

    pub fn label(self) -> &'static str {
        match self {
            ImageScale::FitScreen => "Fit screen",
            ImageScale::Stretch => "Stretch",
            ImageScale::FitWidth => "Fit width",
            ImageScale::FitHeight => "Fit height",
            ImageScale::OriginalSize => "Original size",
            ImageScale::SmartFit => "Smart fit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderModeSettings {
    /// Built-in modes are read-only in the settings screen.
    pub default_mode: bool,
    pub continuous: bool,
    pub direction: Direction,
    pub padding: u16,
    pub image_scale: ImageScale,
    pub fit_size: bool,
    pub max_size: u32,
}

impl Default for ReaderModeSettings {
    fn default() -> Self {
        Self {
            default_mode: false,
            continuous: false,
            direction: Direction::Down,
            padding: 0,
            image_scale: ImageScale::FitScreen,
            fit_size: false,
            max_size: 0,
        }
    }
}

impl ReaderModeSettings {
    fn builtin(direction: Direction, continuous: bool, padding: u16) -> Self {
        Self {
            default_mode: true,
            continuous,
            direction,
            padding,
            ..Self::default()
        }
    }

    /// Gap between pages in terminal rows.
    pub fn padding_cells(&self) -> u16 {
        (u32::from(self.padding) / DP_PER_CELL) as u16
    }

    /// Widest a page may be drawn, in terminal columns. `None` when the
    /// size is not restricted.
    pub fn max_width_cells(&self) -> Option<u16> {
        if !self.fit_size || self.max_size == 0 {
            return None;
        }
        Some((self.max_size / DP_PER_CELL).clamp(1, u32::from(u16::MAX)) as u16)
    }

    pub fn cycle_padding(&mut self) {
        self.padding = next_choice(&padding_choices(), self.padding);
    }

    pub fn cycle_max_size(&mut self) {
        self.max_size = next_choice(&max_size_choices(self.direction), self.max_size);
    }
}

/// The choice after `current`, wrapping around. Values that are not among
/// the choices restart at the first one.
fn next_choice<T: Copy + PartialEq>(choices: &[(T, &'static str)], current: T) -> T {
    match choices.iter().position(|(value, _)| *value == current) {
        Some(index) => choices[(index + 1) % choices.len()].0,
        None => choices[0].0,
    }
}

pub fn choice_label<T: Copy + PartialEq>(choices: &[(T, &'static str)], current: T) -> &'static str {
    choices
        .iter()
        .find(|(value, _)| *value == current)
        .map(|(_, label)| *label)
        .unwrap_or("Custom")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderPreferencesData {
    pub mode: String,
    pub modes: Vec<String>,
    pub mode_settings: BTreeMap<String, ReaderModeSettings>,
}

impl Default for ReaderPreferencesData {
    fn default() -> Self {
        let builtins = [
            ("RTL", ReaderModeSettings::builtin(Direction::Left, false, 0)),
            ("LTR", ReaderModeSettings::builtin(Direction::Right, false, 0)),
            ("Vertical", ReaderModeSettings::builtin(Direction::Down, false, 0)),
            ("Continuous Vertical", ReaderModeSettings::builtin(Direction::Down, true, 16)),
            ("Long Strip", ReaderModeSettings::builtin(Direction::Down, true, 0)),
        ];
        Self {
            mode: "RTL".to_string(),
            modes: builtins.iter().map(|(name, _)| name.to_string()).collect(),
            mode_settings: builtins
                .into_iter()
                .map(|(name, settings)| (name.to_string(), settings))
                .collect(),
        }
    }
}

/// Reader settings shared by every screen, saved as JSON on each change.
#[derive(Clone)]
pub struct ReaderPreferences {
    data: Arc<watch::Sender<ReaderPreferencesData>>,
    path: Option<PathBuf>,
}

fn get_preferences_path() -> PathBuf {
    let dir = config_dir();
    fs::create_dir_all(&dir).ok();
    dir.join("reader.json")
}

impl ReaderPreferences {
    pub fn in_memory(data: ReaderPreferencesData) -> Self {
        Self {
            data: Arc::new(watch::Sender::new(data)),
            path: None,
        }
    }

    pub fn load() -> Self {
        Self::load_from(get_preferences_path())
    }

    pub fn load_from(path: PathBuf) -> Self {
        let data = fs::read_to_string(&path)
            .ok()
            .and_then(|content| match serde_json::from_str(&content) {
                Ok(data) => Some(data),
                Err(e) => {
                    log::warn!("Ignoring unreadable reader preferences {}: {}", path.display(), e);
                    None
                }
            })
            .unwrap_or_default();

        Self {
            data: Arc::new(watch::Sender::new(data)),
            path: Some(path),
        }
    }

    fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let data = self.data.borrow().clone();
        match serde_json::to_string_pretty(&data) {
            Ok(content) => {
                if let Err(e) = fs::write(path, content) {
                    log::warn!("Failed to save reader preferences: {}", e);
                }
            }
            Err(e) => log::warn!("Failed to serialize reader preferences: {}", e),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ReaderPreferencesData> {
        self.data.subscribe()
    }

    pub fn mode(&self) -> String {
        self.data.borrow().mode.clone()
    }

    pub fn modes(&self) -> Vec<String> {
        self.data.borrow().modes.clone()
    }

    pub fn has_mode(&self, mode: &str) -> bool {
        self.data.borrow().modes.iter().any(|m| m == mode)
    }

    /// Unknown modes fall back to default settings.
    pub fn mode_settings(&self, mode: &str) -> ReaderModeSettings {
        self.data
            .borrow()
            .mode_settings
            .get(mode)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_mode(&self, mode: &str) -> bool {
        let changed = self.data.send_if_modified(|data| {
            if data.mode == mode || !data.modes.iter().any(|m| m == mode) {
                return false;
            }
            data.mode = mode.to_string();
            true
        });
        if changed {
            self.save();
        }
        changed
    }

    pub fn add_mode(&self, mode: &str) -> bool {
        let changed = self.data.send_if_modified(|data| {
            if data.modes.iter().any(|m| m == mode) {
                return false;
            }
            data.modes.push(mode.to_string());
            data.mode_settings
                .insert(mode.to_string(), ReaderModeSettings::default());
            true
        });
        if changed {
            self.save();
        }
        changed
    }

    /// Adds the first free `Custom N` mode and returns its name.
    pub fn add_custom_mode(&self) -> String {
        let mut number = self.data.borrow().modes.len();
        loop {
            let name = format!("Custom {}", number);
            if self.add_mode(&name) {
                return name;
            }
            number += 1;
        }
    }

    /// Built-in modes cannot be edited.
    pub fn update_mode_settings(
        &self,
        mode: &str,
        update: impl FnOnce(&mut ReaderModeSettings),
    ) -> bool {
        let changed = self.data.send_if_modified(|data| {
            match data.mode_settings.get_mut(mode) {
                Some(settings) if !settings.default_mode => {
                    let before = settings.clone();
                    update(settings);
                    *settings != before
                }
                _ => false,
            }
        });
        if changed {
            self.save();
        }
        changed
    }
}

impl Default for ReaderPreferences {
    fn default() -> Self {
        Self::in_memory(ReaderPreferencesData::default())
    }
}

pub fn padding_choices() -> Vec<(u16, &'static str)> {
    vec![(0, "None"), (8, "8 Dp"), (16, "16 Dp"), (32, "32 Dp")]
}

pub fn max_size_choices(direction: Direction) -> Vec<(u32, &'static str)> {
    if direction.is_horizontal() {
        vec![(0, "Unrestricted"), (700, "700 Dp"), (900, "900 Dp"), (1100, "1100 Dp")]
    } else {
        vec![(0, "Unrestricted"), (500, "500 Dp"), (700, "700 Dp"), (900, "900 Dp")]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_contain_builtin_modes() {
        let prefs = ReaderPreferences::default();
        assert_eq!(prefs.mode(), "RTL");
        assert!(prefs.has_mode("Long Strip"));
        assert_eq!(prefs.mode_settings("RTL").direction, Direction::Left);
        assert!(prefs.mode_settings("Long Strip").continuous);
        assert_eq!(prefs.mode_settings("missing"), ReaderModeSettings::default());
    }

    #[test]
    fn builtin_modes_are_read_only() {
        let prefs = ReaderPreferences::default();
        assert!(!prefs.update_mode_settings("RTL", |s| s.continuous = true));
        assert!(!prefs.mode_settings("RTL").continuous);
    }

    #[test]
    fn set_mode_rejects_unknown_modes_and_notifies() {
        let prefs = ReaderPreferences::default();
        let mut rx = prefs.subscribe();
        rx.borrow_and_update();

        assert!(!prefs.set_mode("Nope"));
        assert!(!rx.has_changed().unwrap());

        assert!(prefs.set_mode("LTR"));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().mode, "LTR");
    }

    #[test]
    fn custom_mode_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reader.json");

        let prefs = ReaderPreferences::load_from(path.clone());
        assert!(prefs.add_mode("Webtoon"));
        assert!(prefs.update_mode_settings("Webtoon", |s| {
            s.continuous = true;
            s.padding = 8;
        }));
        assert!(prefs.set_mode("Webtoon"));

        let reloaded = ReaderPreferences::load_from(path);
        assert_eq!(reloaded.mode(), "Webtoon");
        let settings = reloaded.mode_settings("Webtoon");
        assert!(settings.continuous);
        assert_eq!(settings.padding, 8);
    }

    #[test]
    fn max_size_choices_depend_on_direction() {
        assert_eq!(max_size_choices(Direction::Left)[3].0, 1100);
        assert_eq!(max_size_choices(Direction::Down)[3].0, 900);
        assert_eq!(padding_choices().len(), 4);
    }

    #[test]
    fn cycling_walks_the_choices_and_wraps() {
        let mut settings = ReaderModeSettings::default();
        let paddings: Vec<u16> = (0..5)
            .map(|_| {
                settings.cycle_padding();
                settings.padding
            })
            .collect();
        assert_eq!(paddings, vec![8, 16, 32, 0, 8]);

        settings.direction = Direction::Left;
        settings.max_size = 123;
        settings.cycle_max_size();
        assert_eq!(settings.max_size, 0);
        settings.cycle_max_size();
        assert_eq!(settings.max_size, 700);
        assert_eq!(choice_label(&max_size_choices(Direction::Left), 700), "700 Dp");

        assert_eq!(ImageScale::SmartFit.next(), ImageScale::FitScreen);
        assert_eq!(Direction::Up.next(), Direction::Down);
    }

    #[test]
    fn sizes_convert_to_terminal_cells() {
        let mut settings = ReaderModeSettings {
            padding: 16,
            max_size: 700,
            ..ReaderModeSettings::default()
        };
        assert_eq!(settings.padding_cells(), 2);
        // max size only applies with fit size on
        assert_eq!(settings.max_width_cells(), None);
        settings.fit_size = true;
        assert_eq!(settings.max_width_cells(), Some(87));
        settings.max_size = 0;
        assert_eq!(settings.max_width_cells(), None);
    }

    #[test]
    fn custom_modes_get_free_names_and_are_editable() {
        let prefs = ReaderPreferences::default();
        let first = prefs.add_custom_mode();
        let second = prefs.add_custom_mode();
        assert_eq!(first, "Custom 5");
        assert_eq!(second, "Custom 6");

        assert!(prefs.update_mode_settings(&first, |s| s.image_scale = s.image_scale.next()));
        assert_eq!(prefs.mode_settings(&first).image_scale, ImageScale::Stretch);
        assert!(prefs.set_mode(&second));
    }
}
