// Rendition selection
//
// Picks one rendition out of what the extractor offers:
// - video: exact quality, else the next lower one, else the best available
// - audio: exact format, else the best audio rendition
// Among equal candidates the higher bitrate, then the larger file, wins.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::models::{AudioFormat, Quality, Rendition, RenditionKind, VideoQuality};

/// Choose the rendition that best matches `desired`.
pub fn select(renditions: &[Rendition], desired: Quality) -> Result<Rendition> {
    let picked = match desired {
        Quality::Best => best_video(renditions, |_| true),
        Quality::Video(quality) => best_video(renditions, |q| q == quality)
            .or_else(|| best_video(renditions, |q| q < quality))
            .or_else(|| best_video(renditions, |_| true)),
        Quality::Audio(format) => best_audio(renditions, |f| f == format)
            .or_else(|| best_audio(renditions, |_| true)),
    };
    picked.cloned().ok_or(Error::NoMatchingRendition(desired))
}

/// Find the counterpart of `previous` in a freshly resolved list, used when a
/// locator expired mid-download. Only an identical kind and container will do,
/// since the bytes already on disk belong to that encoding.
pub fn rematch(previous: &Rendition, fresh: &[Rendition]) -> Option<Rendition> {
    fresh
        .iter()
        .filter(|r| r.kind == previous.kind && r.container == previous.container)
        .max_by(|a, b| prefer_same_size(previous, a, b))
        .cloned()
}

fn best_video(
    renditions: &[Rendition],
    accept: impl Fn(VideoQuality) -> bool,
) -> Option<&Rendition> {
    renditions
        .iter()
        .filter_map(|r| match r.kind {
            RenditionKind::Video(q) if accept(q) => Some((q, r)),
            _ => None,
        })
        .max_by(|(qa, a), (qb, b)| qa.cmp(qb).then_with(|| richer(a, b)))
        .map(|(_, r)| r)
}

fn best_audio(
    renditions: &[Rendition],
    accept: impl Fn(AudioFormat) -> bool,
) -> Option<&Rendition> {
    renditions
        .iter()
        .filter(|r| matches!(r.kind, RenditionKind::Audio(f) if accept(f)))
        .max_by(|a, b| richer(a, b))
}

fn richer(a: &Rendition, b: &Rendition) -> Ordering {
    let bitrate = |r: &Rendition| r.bitrate_kbps.unwrap_or(0.0);
    bitrate(a)
        .partial_cmp(&bitrate(b))
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.approx_size.unwrap_or(0).cmp(&b.approx_size.unwrap_or(0)))
}

fn prefer_same_size(previous: &Rendition, a: &Rendition, b: &Rendition) -> Ordering {
    let matches = |r: &Rendition| previous.approx_size.is_some() && r.approx_size == previous.approx_size;
    matches(a).cmp(&matches(b)).then_with(|| richer(a, b))
}
