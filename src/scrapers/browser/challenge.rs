//! Anti-bot challenge page detection.

/// Lowercased text fragments that only appear on interstitial challenge pages.
const CHALLENGE_MARKERS: &[&str] = &[
    "just a moment",
    "checking your browser",
    "cf-challenge",
    "verify you are human",
    "ddos protection by",
];

/// Whether rendered HTML is still a challenge interstitial.
pub fn is_challenge_page(html: &str) -> bool {
    let lowered = html.to_lowercase();
    CHALLENGE_MARKERS.iter().any(|m| lowered.contains(m))
}
