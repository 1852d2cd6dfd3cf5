use regex::Regex;

use super::{MediaError, MediaResult};

/// One video frame as reported by the framemd5 muxer.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub pts: i64,
    pub hash: String,
}

/// Content fingerprints of a file's video frames, in presentation order.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameHashes {
    pub timebase_num: i64,
    pub timebase_den: i64,
    pub frames: Vec<FrameRecord>,
}

impl FrameHashes {
    pub fn pts_seconds(&self, frame: &FrameRecord) -> f64 {
        if self.timebase_den == 0 {
            return 0.0;
        }
        frame.pts as f64 * self.timebase_num as f64 / self.timebase_den as f64
    }

    pub fn first_hash(&self) -> Option<&str> {
        self.frames.first().map(|frame| frame.hash.as_str())
    }
}

/// Parse `ffmpeg -f framemd5` output: a `#tb 0: num/den` header followed by
/// `stream, dts, pts, duration, size, hash` rows.
pub fn parse_framemd5(output: &str) -> MediaResult<FrameHashes> {
    let timebase = Regex::new(r"#tb\s+0:\s*(\d+)/(\d+)").unwrap();
    let (timebase_num, timebase_den) = output
        .lines()
        .find_map(|line| {
            let captures = timebase.captures(line)?;
            let num = captures[1].parse::<i64>().ok()?;
            let den = captures[2].parse::<i64>().ok()?;
            Some((num, den))
        })
        .ok_or_else(|| MediaError::Parse {
            kind: "framemd5",
            detail: "missing #tb timebase header".into(),
        })?;
    if timebase_den == 0 {
        return Err(MediaError::Parse {
            kind: "framemd5",
            detail: "zero timebase denominator".into(),
        });
    }

    let mut frames = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line
            .split(',')
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .collect();
        if fields.len() < 6 {
            return Err(MediaError::Parse {
                kind: "framemd5",
                detail: format!("short frame row: {line}"),
            });
        }
        let pts = fields[2].parse::<i64>().map_err(|_| MediaError::Parse {
            kind: "framemd5",
            detail: format!("bad pts in row: {line}"),
        })?;
        frames.push(FrameRecord {
            pts,
            hash: fields[5].to_string(),
        });
    }

    Ok(FrameHashes {
        timebase_num,
        timebase_den,
        frames,
    })
}
