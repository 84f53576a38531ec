use once_cell::sync::Lazy;
use regex::Regex;

static EPISODE_NUM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)회").expect("episode number pattern"));
static MOVIE_TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+회\s*[-–]\s*(.+)").expect("movie title pattern"));

/// Splits a raw feed title into the running episode number and the movie title.
///
/// `"128회 - 기생충"` yields `(Some(128), "기생충")`. Titles without the
/// `N회` marker, or without a dash after it, keep the full title as the
/// movie title. Pure string work, no I/O.
#[must_use]
pub fn parse_title(title: &str) -> (Option<u32>, String) {
    let episode_num = EPISODE_NUM_RE
        .captures(title)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok());

    let movie_title = MOVIE_TITLE_RE
        .captures(title)
        .and_then(|caps| caps.get(1))
        .map_or_else(|| title.to_string(), |m| m.as_str().trim().to_string());

    (episode_num, movie_title)
}
