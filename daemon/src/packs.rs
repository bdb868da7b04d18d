//! Installed sound packs: manifest lookup and sound selection.
//!
//! A pack is a directory holding `openpeon.json` (or the older
//! `manifest.json`) and its audio files, normally under `sounds/`. Every
//! failure here (missing pack, unreadable manifest, missing file) resolves to
//! "nothing to play" rather than an error, since having no packs is a normal
//! state before the first install.
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::category::Category;

pub const MANIFEST_FILE_NAMES: [&str; 2] = ["openpeon.json", "manifest.json"];
pub const SOUNDS_DIR_NAME: &str = "sounds";
pub const PACK_ICON_FILE_NAME: &str = "icon.png";

#[derive(Debug, Clone, Deserialize)]
pub struct PackManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub categories: BTreeMap<String, CategorySounds>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CategorySounds {
    #[serde(default)]
    pub sounds: Vec<SoundEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SoundEntry {
    pub file: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl PackManifest {
    pub fn sounds(&self, category: &str) -> &[SoundEntry] {
        self.categories
            .get(category)
            .map(|c| c.sounds.as_slice())
            .unwrap_or_default()
    }
}

/// A concrete, existing sound file chosen for playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoundRef {
    /// Manifest `file` value; what anti-repeat compares against.
    pub id: String,
    pub path: PathBuf,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackInfo {
    pub id: String,
    pub display_name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PackCatalog {
    packs_dir: PathBuf,
    legacy_dir: Option<PathBuf>,
}

impl PackCatalog {
    pub fn new(packs_dir: PathBuf, legacy_dir: Option<PathBuf>) -> Self {
        Self {
            packs_dir,
            legacy_dir,
        }
    }

    /// The primary directory if it has anything in it, else a non-empty
    /// legacy directory, else the (empty) primary one.
    pub fn packs_dir(&self) -> &Path {
        if has_entries(&self.packs_dir) {
            return &self.packs_dir;
        }
        match &self.legacy_dir {
            Some(legacy) if has_entries(legacy) => legacy,
            _ => &self.packs_dir,
        }
    }

    /// Directory of the pack `id`, or `None` if the id would escape the packs
    /// directory.
    pub fn pack_path(&self, id: &str) -> Option<PathBuf> {
        if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
            return None;
        }
        Some(self.packs_dir().join(id))
    }

    pub fn manifest(&self, id: &str) -> Option<PackManifest> {
        self.pack_path(id).and_then(|p| load_manifest(&p))
    }

    /// Installed packs with a readable manifest, sorted by id.
    pub fn list_packs(&self) -> Vec<PackInfo> {
        let Ok(entries) = std::fs::read_dir(self.packs_dir()) else {
            return Vec::new();
        };
        let mut packs: Vec<PackInfo> = entries
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let path = e.path();
                let manifest = load_manifest(&path)?;
                // The directory name is the id `pack_path` resolves.
                let id = e.file_name().to_string_lossy().into_owned();
                let display_name = manifest
                    .display_name
                    .or_else(|| (!manifest.name.is_empty()).then_some(manifest.name))
                    .unwrap_or_else(|| id.clone());
                Some(PackInfo {
                    id,
                    display_name,
                    path,
                })
            })
            .collect();
        packs.sort_by(|a, b| a.id.cmp(&b.id));
        packs
    }

    pub fn has_packs(&self) -> bool {
        !self.list_packs().is_empty()
    }

    pub fn pick_sound(
        &self,
        category: Category,
        pack_id: &str,
        last_played: Option<&str>,
    ) -> Option<SoundRef> {
        self.pick_sound_with(category, pack_id, last_played, &mut rand::thread_rng())
    }

    /// Chooses a sound for `category`, avoiding `last_played` when another
    /// candidate exists. The caller records the returned `id`.
    pub fn pick_sound_with<R: Rng + ?Sized>(
        &self,
        category: Category,
        pack_id: &str,
        last_played: Option<&str>,
        rng: &mut R,
    ) -> Option<SoundRef> {
        let pack_path = self.pack_path(pack_id)?;
        let Some(manifest) = load_manifest(&pack_path) else {
            debug!("No manifest for pack '{pack_id}'");
            return None;
        };
        let sounds = manifest.sounds(category.as_str());

        let mut candidates: Vec<&SoundEntry> = if sounds.len() > 1 {
            sounds
                .iter()
                .filter(|s| Some(s.file.as_str()) != last_played)
                .collect()
        } else {
            sounds.iter().collect()
        };
        if candidates.is_empty() {
            candidates = sounds.iter().collect();
        }

        let pick = *candidates.choose(rng)?;
        let Some(path) = resolve_sound_file(&pack_path, &pick.file) else {
            debug!("Sound '{}' in pack '{pack_id}' is missing", pick.file);
            return None;
        };
        Some(SoundRef {
            id: pick.file.clone(),
            path,
            label: pick.label.clone().unwrap_or_else(|| file_name_label(&pick.file)),
        })
    }

    /// A clip to audition a pack: a `session.start` sound if it has one,
    /// else anything from the first category that has sounds.
    pub fn preview_sound(&self, pack_id: &str) -> Option<PathBuf> {
        let pack_path = self.pack_path(pack_id)?;
        let manifest = load_manifest(&pack_path)?;
        let sounds = match manifest.sounds(Category::SessionStart.as_str()) {
            [] => manifest
                .categories
                .values()
                .map(|c| c.sounds.as_slice())
                .find(|s| !s.is_empty())?,
            sounds => sounds,
        };
        let pick = sounds.choose(&mut rand::thread_rng())?;
        resolve_sound_file(&pack_path, &pick.file)
    }

    /// `<pack>/icon.png` if the pack ships one.
    pub fn pack_icon(&self, pack_id: &str) -> Option<PathBuf> {
        self.pack_path(pack_id)
            .map(|p| p.join(PACK_ICON_FILE_NAME))
            .filter(|p| p.is_file())
    }
}

pub fn load_manifest(pack_path: &Path) -> Option<PackManifest> {
    MANIFEST_FILE_NAMES.iter().find_map(|name| {
        let path = pack_path.join(name);
        let content = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                debug!("Ignoring {}: {e}", path.display());
                None
            }
        }
    })
}

/// Entries with a directory separator are pack-relative, bare names live in
/// `sounds/`. Returns `None` if the file is missing or would leave the pack.
pub fn resolve_sound_file(pack_path: &Path, file: &str) -> Option<PathBuf> {
    let relative = Path::new(file);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return None;
    }
    let path = if file.contains(['/', '\\']) {
        pack_path.join(relative)
    } else {
        pack_path.join(SOUNDS_DIR_NAME).join(relative)
    };
    path.is_file().then_some(path)
}

fn file_name_label(file: &str) -> String {
    Path::new(file)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.to_string())
}

fn has_entries(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}
