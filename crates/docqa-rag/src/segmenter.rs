//! 文本分段器
//!
//! 将规范化后的文本切成带重叠的滑动窗口,优先在句子边界断开,
//! 其次在段落空行处断开,都找不到时按目标长度硬切。
//! 所有偏移量均以字符计数,与存储层的 `start_offset`/`end_offset` 一致。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterConfig {
    /// 目标窗口长度(字符)
    pub target_chars: usize,
    /// 相邻窗口重叠长度(字符)
    pub overlap_chars: usize,
    /// 低于该长度(trim 后)的块直接丢弃
    pub min_chars: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            target_chars: 1000,
            overlap_chars: 200,
            min_chars: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// 在文档内的序号,从 0 开始连续编号
    pub ord: i32,
    pub text: String,
    /// 规范化文本中的起始字符偏移
    pub start_offset: usize,
    /// 规范化文本中的结束字符偏移(不含)
    pub end_offset: usize,
}

/// 抽取结果先经过规范化再分段:
/// 统一换行为 `\n`,压缩水平空白,三个以上连续换行压成一个空行,
/// 并去掉首尾空白。
pub fn normalize(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut newlines = 0usize;
    let mut pending_space = false;
    for ch in unified.chars() {
        match ch {
            '\n' => {
                newlines += 1;
                // 行尾空白一并丢弃
                pending_space = false;
            }
            ' ' | '\t' => pending_space = true,
            _ => {
                if newlines > 0 {
                    if !out.is_empty() {
                        for _ in 0..newlines.min(2) {
                            out.push('\n');
                        }
                    }
                    newlines = 0;
                } else if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push(ch);
            }
        }
    }
    out
}

/// 把文本切成重叠窗口。窗口先取 `target_chars` 长,再在窗口后半段
/// 向前找句末标点;找不到就找段落空行;仍找不到则硬切。
/// 下一个窗口从 `end - overlap_chars` 开始,且保证每步至少前进一个字符。
pub fn segment(text: &str, cfg: &SegmenterConfig) -> Vec<Segment> {
    let cleaned = normalize(text);
    let chars: Vec<char> = cleaned.chars().collect();
    let n = chars.len();
    if n == 0 {
        return Vec::new();
    }

    let mut windows: Vec<(usize, usize)> = Vec::new();
    let mut start = 0usize;
    loop {
        let nominal_end = (start + cfg.target_chars).min(n);
        let mut end = nominal_end;
        if nominal_end < n {
            let mid = start + (nominal_end - start) / 2;
            if let Some(e) = snap_to_sentence(&chars, mid, nominal_end) {
                end = e;
            } else if let Some(e) = snap_to_paragraph(&chars, mid, nominal_end) {
                end = e;
            }
        }
        windows.push((start, end));
        if end >= n {
            break;
        }
        start = end.saturating_sub(cfg.overlap_chars).max(start + 1);
    }

    let mut segments = Vec::with_capacity(windows.len());
    let mut ord = 0i32;
    for (s, e) in windows {
        let raw: String = chars[s..e].iter().collect();
        let trimmed = raw.trim();
        if trimmed.chars().count() < cfg.min_chars {
            continue;
        }
        segments.push(Segment {
            ord,
            text: trimmed.to_string(),
            start_offset: s,
            end_offset: e,
        });
        ord += 1;
    }
    segments
}

/// 在 [mid, nominal_end) 内自后向前找句末位置,返回紧跟标点之后的偏移。
/// 句末指 `.`/`!`/`?` 后接空白或文本结尾,也接受标点后紧跟引号的情况。
fn snap_to_sentence(chars: &[char], mid: usize, nominal_end: usize) -> Option<usize> {
    for i in (mid..nominal_end).rev() {
        let end = i + 1;
        let c = chars[i];
        let candidate = if matches!(c, '.' | '!' | '?') {
            true
        } else {
            matches!(c, '"' | '\'' | '”' | '’')
                && i > 0
                && matches!(chars[i - 1], '.' | '!' | '?')
        };
        if !candidate {
            continue;
        }
        match chars.get(end) {
            None => return Some(end),
            Some(' ') | Some('\n') => return Some(end),
            _ => {}
        }
    }
    None
}

/// 在 [mid, nominal_end) 内自后向前找段落空行(连续两个换行),
/// 窗口在空行之前结束。
fn snap_to_paragraph(chars: &[char], mid: usize, nominal_end: usize) -> Option<usize> {
    for i in (mid..nominal_end).rev() {
        if chars[i] == '\n' && chars.get(i + 1) == Some(&'\n') {
            return Some(i);
        }
    }
    None
}
