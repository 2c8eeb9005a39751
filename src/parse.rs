//! 结构化输出自愈解析
//!
//! LLM 的回复可能把 JSON 裹在解释文字或代码围栏里，也可能带全角引号、
//! 尾逗号或字符串内的裸换行。修复管线分三级，前一级失败才进入下一级：
//! (1) 原文严格解析；(2) 提取最大平衡括号子串（`{}` 或 `[]`）后严格解析；
//! (3) 文本归一化（去围栏、引号归一、去尾逗号、转义串内换行）后重做 (2)。
//! 三级耗尽返回 ParseFailed。修复只碰语法，绝不发明输入里没有的字段，
//! 字符串字面量内部的内容一律原样保留。

use crate::core::AgentError;
use crate::page::ProposedSelection;

/// 修复并解析为任意 JSON 值（路由决策等小对象也走这里）
pub fn repair_value(raw: &str) -> Result<serde_json::Value, AgentError> {
    let trimmed = raw.trim();

    // 一级：原文即合法 JSON
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    // 二级：剥出最大平衡括号区域
    if let Some(region) = largest_balanced_region(trimmed) {
        if let Ok(value) = serde_json::from_str(region) {
            return Ok(value);
        }
    }

    // 三级：归一化后重试二级
    let normalized = normalize(trimmed);
    if let Some(region) = largest_balanced_region(&normalized) {
        if let Ok(value) = serde_json::from_str(region) {
            return Ok(value);
        }
    }

    Err(AgentError::ParseFailed(preview(trimmed)))
}

/// 修复并解析为字段选择对象
pub fn repair(raw: &str) -> Result<ProposedSelection, AgentError> {
    let value = repair_value(raw)?;
    serde_json::from_value(value).map_err(|e| AgentError::ParseFailed(e.to_string()))
}

/// 最大的顶层平衡 `{...}` 或 `[...]` 子串（对字符串字面量与转义保持感知）
fn largest_balanced_region(text: &str) -> Option<&str> {
    let mut best: Option<(usize, usize)> = None;
    let mut start = None;
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' if !stack.is_empty() => in_string = true,
            '{' | '[' => {
                if stack.is_empty() {
                    start = Some(i);
                }
                stack.push(c);
            }
            '}' | ']' if !stack.is_empty() => match (stack.last(), c) {
                (Some('{'), '}') | (Some('['), ']') => {
                    stack.pop();
                    if stack.is_empty() {
                        let s = start.take()?;
                        let end = i + c.len_utf8();
                        if best.map_or(true, |(bs, be)| end - s > be - bs) {
                            best = Some((s, end));
                        }
                    }
                }
                // 括号错配：整段作废，从下一个起始符重新开始
                _ => {
                    stack.clear();
                    start = None;
                }
            },
            _ => {}
        }
    }
    best.map(|(s, e)| &text[s..e])
}

/// 三级归一化：围栏、引号、尾逗号、串内裸换行
fn normalize(text: &str) -> String {
    let mut out = strip_fences(text);
    for (from, to) in [('“', '"'), ('”', '"'), ('＂', '"'), ('‘', '\''), ('’', '\'')] {
        out = out.replace(from, &to.to_string());
    }
    out = strip_trailing_commas(&out);
    escape_newlines_in_strings(&out)
}

fn strip_fences(text: &str) -> String {
    if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = rest.find("```") {
            return rest[..end].trim().to_string();
        }
        return rest.trim().to_string();
    }
    text.to_string()
}

/// 去掉闭合符前的尾逗号；字符串字面量内部的逗号不动
fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            i += 1;
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }
        if c == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                // 丢弃逗号本身，中间的空白照常输出
                i += 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

/// 字符串字面量内部的裸换行替换为 `\n` 转义
fn escape_newlines_in_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => {}
                _ => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }
    out
}

fn preview(text: &str) -> String {
    let mut s: String = text.chars().take(120).collect();
    if s.len() < text.len() {
        s.push('…');
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_formed_passes_first_stage_unchanged() {
        let raw = r#"{"地区": ["广东"], "行业": ["汽车玻璃"]}"#;
        let value = repair_value(raw).unwrap();
        assert_eq!(value, serde_json::from_str::<serde_json::Value>(raw).unwrap());
        // 幂等：再过一遍管线仍是同一结构
        let again = repair_value(&value.to_string()).unwrap();
        assert_eq!(again, value);
    }

    #[test]
    fn test_recovers_json_wrapped_in_prose() {
        let raw = "好的，以下是我的选择：\n{\"地区\": \"广东\"}\n请确认。";
        let sel = repair(raw).unwrap();
        assert_eq!(sel.labels("地区"), ["广东"]);
    }

    #[test]
    fn test_recovers_trailing_comma() {
        let raw = r#"{"地区": ["广东", "北京",], "行业": ["汽车玻璃"],}"#;
        let sel = repair(raw).unwrap();
        assert_eq!(sel.labels("地区"), ["广东", "北京"]);
    }

    #[test]
    fn test_recovers_code_fence_and_smart_quotes() {
        let raw = "```json\n{“地区”: [“广东”]}\n```";
        let sel = repair(raw).unwrap();
        assert_eq!(sel.labels("地区"), ["广东"]);
    }

    #[test]
    fn test_recovers_raw_newline_inside_string() {
        let raw = "{\"备注\": \"第一行\n第二行\"}";
        let value = repair_value(raw).unwrap();
        assert_eq!(value["备注"], "第一行\n第二行");
    }

    #[test]
    fn test_picks_largest_balanced_region() {
        let raw = r#"{"a": 1} 然后是完整版 {"地区": ["广东"], "行业": ["汽车玻璃"]}"#;
        let sel = repair(raw).unwrap();
        assert_eq!(sel.labels("行业"), ["汽车玻璃"]);
    }

    #[test]
    fn test_braces_inside_strings_do_not_confuse_scan() {
        let raw = r#"前缀 {"备注": "花括号 } 在字符串里", "地区": ["广东"]} 后缀"#;
        let value = repair_value(raw).unwrap();
        assert_eq!(value["地区"][0], "广东");
    }

    #[test]
    fn test_recovers_top_level_array_reply() {
        let raw = "候选标签如下：[\"汽车玻璃\", \"汽车电子\"]，请确认。";
        let value = repair_value(raw).unwrap();
        assert_eq!(value[0], "汽车玻璃");
        assert_eq!(value[1], "汽车电子");
    }

    #[test]
    fn test_trailing_comma_inside_string_is_preserved() {
        // 串内的 ",}" 不是尾逗号，归一化不得改写标签内容
        let raw = r#"{“地区”: [“广,}东”,],}"#;
        let sel = repair(raw).unwrap();
        assert_eq!(sel.labels("地区"), ["广,}东"]);
    }

    #[test]
    fn test_exhausted_pipeline_is_parse_failed() {
        let raw = "这里完全没有结构化内容，{ 也没有闭合";
        assert!(matches!(repair_value(raw), Err(AgentError::ParseFailed(_))));
    }

    #[test]
    fn test_repair_never_fabricates_fields() {
        let raw = r#"{"行业": ["汽车玻璃"],}"#;
        let sel = repair(raw).unwrap();
        assert_eq!(sel.0.len(), 1);
        assert!(sel.labels("地区").is_empty());
    }
}
