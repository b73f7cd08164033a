//
// Copyright 2024 the worldvoice authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Offer/answer text surgery.
//!
//! The media engine's default offer does not match the voice server's
//! stereo/inband-FEC expectation, so the Opus fmtp line is rewritten before
//! the offer leaves the client. Answers are sanitized of the zero-port
//! candidate lines the server sometimes emits.

use anyhow::Result;

use crate::error::VoiceError;

/// The Opus parameters the voice server expects: stereo both ways, 48 kHz,
/// inband FEC. Sent verbatim; the server compares them textually.
pub const OPUS_PARAMETERS: &str =
    "minptime=10;useinbandfec=1;stereo=1;sprop-stereo=1;maxplaybackrate=48000;sprop-maxplaybackrate=48000;sprop-maxcapturerate=48000";

/// Pins the offer's Opus fmtp line to [`OPUS_PARAMETERS`], replacing the
/// engine's default parameters or inserting a line if the offer carried
/// none. An offer without an Opus rtpmap cannot be fixed up and is an
/// error.
pub fn rewrite_opus_parameters(sdp: &str) -> Result<String> {
    let mut lines: Vec<String> = sdp.lines().map(str::to_string).collect();

    let rtpmap_index = lines
        .iter()
        .position(|line| {
            line.starts_with("a=rtpmap:") && line.to_ascii_lowercase().contains(" opus/48000")
        })
        .ok_or(VoiceError::MungeSdp)?;
    let payload_type = lines[rtpmap_index]
        .strip_prefix("a=rtpmap:")
        .and_then(|rest| rest.split_whitespace().next())
        .ok_or(VoiceError::MungeSdp)?
        .to_string();

    let fmtp_line = format!("a=fmtp:{} {}", payload_type, OPUS_PARAMETERS);
    let fmtp_prefix = format!("a=fmtp:{} ", payload_type);
    match lines.iter().position(|line| line.starts_with(&fmtp_prefix)) {
        Some(index) => lines[index] = fmtp_line,
        None => lines.insert(rtpmap_index + 1, fmtp_line),
    }

    Ok(join_sdp_lines(&lines))
}

/// Removes `a=candidate` lines whose port field is literally `0` before
/// the answer is applied as the remote description.
pub fn drop_zero_port_candidates(sdp: &str) -> String {
    let lines: Vec<String> = sdp
        .lines()
        .filter(|line| !is_zero_port_candidate(line))
        .map(str::to_string)
        .collect();
    join_sdp_lines(&lines)
}

fn is_zero_port_candidate(line: &str) -> bool {
    if !line.starts_with("a=candidate") {
        return false;
    }
    // a=candidate:<foundation> <component> <proto> <priority> <addr> <port> typ ...
    line.split_whitespace().nth(5) == Some("0")
}

fn join_sdp_lines(lines: &[String]) -> String {
    let mut sdp = lines.join("\r\n");
    sdp.push_str("\r\n");
    sdp
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER_WITH_FMTP: &str = "v=0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        a=fmtp:111 minptime=10;useinbandfec=1\r\n\
        a=rtpmap:63 red/48000/2\r\n";

    #[test]
    fn replaces_existing_opus_fmtp_line() {
        let rewritten = rewrite_opus_parameters(OFFER_WITH_FMTP).unwrap();
        assert!(rewritten.contains(&format!("a=fmtp:111 {}\r\n", OPUS_PARAMETERS)));
        assert!(!rewritten.contains("a=fmtp:111 minptime=10;useinbandfec=1\r\n"));
        // Other lines survive untouched.
        assert!(rewritten.contains("a=rtpmap:63 red/48000/2\r\n"));
    }

    #[test]
    fn inserts_fmtp_line_when_missing() {
        let offer = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 96\r\na=rtpmap:96 opus/48000/2\r\n";
        let rewritten = rewrite_opus_parameters(offer).unwrap();
        assert!(rewritten.contains(&format!(
            "a=rtpmap:96 opus/48000/2\r\na=fmtp:96 {}\r\n",
            OPUS_PARAMETERS
        )));
    }

    #[test]
    fn offer_without_opus_is_an_error() {
        let offer = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 0\r\na=rtpmap:0 PCMU/8000\r\n";
        assert!(rewrite_opus_parameters(offer).is_err());
    }

    #[test]
    fn drops_only_zero_port_candidate_lines() {
        let answer = "v=0\r\n\
            a=candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host\r\n\
            a=candidate:2 1 udp 2122260222 10.0.0.2 0 typ host\r\n\
            a=rtpmap:111 opus/48000/2\r\n";
        let sanitized = drop_zero_port_candidates(answer);
        assert!(sanitized.contains("10.0.0.1 50000"));
        assert!(!sanitized.contains("10.0.0.2 0 typ host"));
        assert!(sanitized.contains("a=rtpmap:111 opus/48000/2\r\n"));
    }
}
