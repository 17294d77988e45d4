//! 文本归一化

/// 逐字符折叠：全角数字转半角，各种横线统一为 `-`，全角空格转半角
///
/// 保持字符数量不变，可以直接用于需要对齐偏移的场景。
pub fn fold_width(text: &str) -> String {
    text.chars().map(fold_char).collect()
}

fn fold_char(c: char) -> char {
    match c {
        '０'..='９' => char::from(b'0' + (c as u32 - '０' as u32) as u8),
        'ー' | '−' | '－' | '‐' | '‑' | '–' | '—' => '-',
        '\u{3000}' => ' ',
        _ => c,
    }
}

/// 完整归一化：折叠宽度、小写化、合并空白、去除首尾空白
///
/// 幂等：`normalize(normalize(x)) == normalize(x)`。
pub fn normalize(text: &str) -> String {
    let folded = fold_width(text).to_lowercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}
