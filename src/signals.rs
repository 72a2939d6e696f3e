// SPDX-License-Identifier: MPL-2.0

//! Reconfiguration signals derived from changes to the config file.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use sctk::reexports::calloop::{LoopHandle, channel};
use vidpaper_config::{ConfigStore, Entry};

/// What changed in the configuration, most disruptive first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    SourceChanged,
    /// Playback mode, scaling, transform, audio or preview.
    SettingsChanged,
    /// Only the status bar color; playback is left alone.
    StatusBarColorChanged,
}

/// Classify the difference between two configurations.
#[must_use]
pub fn diff(old: &Entry, new: &Entry) -> Option<Signal> {
    if old.source_uri() != new.source_uri() {
        Some(Signal::SourceChanged)
    } else if old.playback_mode != new.playback_mode
        || old.scaling_mode != new.scaling_mode
        || old.transform != new.transform
        || old.audio != new.audio
        || old.preview != new.preview
    {
        Some(Signal::SettingsChanged)
    } else if old.status_bar_color != new.status_bar_color {
        Some(Signal::StatusBarColorChanged)
    } else {
        None
    }
}

/// Watch the config file and call `on_signal` on the event loop for every
/// meaningful change. The watcher stops when the returned value is dropped.
pub fn watch_config<H: 'static>(
    handle: &LoopHandle<'static, H>,
    store: ConfigStore,
    mut on_signal: impl FnMut(Signal, &mut H) + 'static,
) -> eyre::Result<RecommendedWatcher> {
    let (notify_tx, notify_rx) = channel::sync_channel::<notify::Event>(20);

    let Some(dir) = store.path().parent().map(ToOwned::to_owned) else {
        eyre::bail!("config path {} has no parent", store.path().display());
    };
    std::fs::create_dir_all(&dir)?;

    let file_name = store.path().file_name().map(ToOwned::to_owned);
    let mut cached = store.load();

    handle
        .insert_source(notify_rx, move |event, _, data: &mut H| match event {
            channel::Event::Msg(event) => {
                let relevant = matches!(
                    event.kind,
                    notify::EventKind::Create(_)
                        | notify::EventKind::Modify(_)
                        | notify::EventKind::Remove(_)
                ) && event
                    .paths
                    .iter()
                    .any(|path| path.file_name() == file_name.as_deref());

                if !relevant {
                    return;
                }

                let entry = store.load();
                let signal = diff(&cached, &entry);
                cached = entry;

                if let Some(signal) = signal {
                    tracing::debug!(?signal, "configuration changed");
                    on_signal(signal, data);
                }
            }
            channel::Event::Closed => {
                tracing::debug!("config watcher channel closed");
            }
        })
        .map_err(|err| eyre::eyre!("{}", err))?;

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let _ = notify_tx.send(event);
            }
            Err(why) => tracing::warn!(?why, "config watcher error"),
        },
        notify::Config::default(),
    )?;

    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    tracing::debug!(dir = %dir.display(), "watching configuration");

    Ok(watcher)
}
