//! HLS playlist and segment helpers: naming conventions, content types and
//! manifest inspection/rewriting.

/// Content-Type for HLS master/variant playlists.
pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Content-Type for MPEG-TS segments.
pub const SEGMENT_CONTENT_TYPE_TS: &str = "video/mp2t";

/// Live playlist written by the transcoder inside a session directory.
pub const PLAYLIST_NAME: &str = "index.m3u8";

/// Zero-byte marker written once the transcoder exits successfully.
pub const COMPLETE_MARKER: &str = ".complete";

/// Session descriptor written next to the playlist.
pub const DESCRIPTOR_NAME: &str = "session.json";

/// Transcoder diagnostic output.
pub const LOG_NAME: &str = "ffmpeg.log";

/// `segment<N>.ts`
pub fn segment_file_name(index: u32) -> String {
    format!("segment{index}.ts")
}

/// ffmpeg `-hls_segment_filename` pattern matching [`segment_file_name`].
pub fn segment_pattern() -> &'static str {
    "segment%d.ts"
}

/// Parse a segment identifier of the form `segment<N>.ts`. Anything else,
/// including path separators, is rejected.
pub fn parse_segment_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("segment")?.strip_suffix(".ts")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// URI lines of a media playlist (everything that is not blank or a tag).
pub fn segment_uris(manifest: &str) -> impl Iterator<Item = &str> {
    manifest
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

pub fn count_segments(manifest: &str) -> usize {
    segment_uris(manifest).count()
}

/// Whether the playlist already references segment `index`; ffmpeg only lists a
/// segment after it has finished writing it.
pub fn lists_segment(manifest: &str, index: u32) -> bool {
    segment_uris(manifest).any(|uri| parse_segment_name(uri) == Some(index))
}

/// Replace every segment URI line with `rewrite(uri)`, keeping tags untouched.
pub fn rewrite_manifest<F>(manifest: &str, mut rewrite: F) -> String
where
    F: FnMut(&str) -> String,
{
    let mut out = String::with_capacity(manifest.len() * 2);
    for line in manifest.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push_str(line);
        } else {
            out.push_str(&rewrite(trimmed));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYLIST: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n\
#EXT-X-MEDIA-SEQUENCE:0\n#EXT-X-PLAYLIST-TYPE:EVENT\n#EXTINF:2.000000,\nsegment0.ts\n\
#EXTINF:2.000000,\nsegment1.ts\n";

    #[test]
    fn segment_names_round_trip() {
        assert_eq!(segment_file_name(7), "segment7.ts");
        assert_eq!(parse_segment_name("segment7.ts"), Some(7));
        assert_eq!(parse_segment_name("segment.ts"), None);
        assert_eq!(parse_segment_name("segment+1.ts"), None);
        assert_eq!(parse_segment_name("../segment1.ts"), None);
        assert_eq!(parse_segment_name("segment1.m4s"), None);
    }

    #[test]
    fn counts_and_finds_segments() {
        assert_eq!(count_segments(PLAYLIST), 2);
        assert!(lists_segment(PLAYLIST, 1));
        assert!(!lists_segment(PLAYLIST, 2));
        assert_eq!(count_segments("#EXTM3U\n#EXT-X-VERSION:3\n"), 0);
    }

    #[test]
    fn rewrites_only_uri_lines() {
        let rewritten = rewrite_manifest(PLAYLIST, |uri| format!("/play?segment={uri}"));
        assert!(rewritten.contains("/play?segment=segment0.ts"));
        assert!(rewritten.contains("/play?segment=segment1.ts"));
        assert!(rewritten.contains("#EXT-X-TARGETDURATION:2"));
        assert!(!rewritten.lines().any(|l| l == "segment0.ts"));
    }
}
