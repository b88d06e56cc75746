//! PT状态块编解码
//!
//! 状态以带标记的JSON块嵌在记录源的自由文本字段里。编解码器只动
//! 标记对覆盖的那一段，其余字节原样保留。块不存在时解码返回None，
//! 编码负责追加一个新块。
//!
//! 标记对归编排器独占所有，其他工具不得触碰。

use chrono::{DateTime, Utc};

use orchestrator_core::{OrchestratorError, OrchestratorResult};

use crate::entities::{PtRecord, STATE_FORMAT_VERSION};

pub const STATE_BLOCK_START: &str = "PT_STATE_JSON_START";
pub const STATE_BLOCK_END: &str = "PT_STATE_JSON_END";

/// 定位标记块在原文中的字节范围（含两侧标记）及payload范围
fn locate_block(raw: &str) -> Option<(std::ops::Range<usize>, std::ops::Range<usize>)> {
    let start_idx = raw.find(STATE_BLOCK_START)?;
    let payload_start = start_idx + STATE_BLOCK_START.len();
    let end_rel = raw[payload_start..].find(STATE_BLOCK_END)?;
    let end_idx = payload_start + end_rel;
    let block = start_idx..end_idx + STATE_BLOCK_END.len();
    let payload = payload_start..end_idx;
    Some((block, payload))
}

/// 解码嵌入的状态记录。
///
/// 没有标记块返回 `Ok(None)`（调用方创建初始记录）；
/// 有开始标记但payload不合法、缺结束标记或版本不支持时返回
/// `StateCorruption`，由本轮跳过该PT。
pub fn decode(pt_id: i64, raw: &str) -> OrchestratorResult<Option<PtRecord>> {
    let start_idx = match raw.find(STATE_BLOCK_START) {
        Some(idx) => idx,
        None => return Ok(None),
    };

    let payload_start = start_idx + STATE_BLOCK_START.len();
    let end_rel = raw[payload_start..].find(STATE_BLOCK_END).ok_or_else(|| {
        OrchestratorError::StateCorruption {
            pt_id,
            message: format!("存在 {STATE_BLOCK_START} 但缺少 {STATE_BLOCK_END}"),
        }
    })?;

    let payload = raw[payload_start..payload_start + end_rel].trim();
    let record: PtRecord =
        serde_json::from_str(payload).map_err(|e| OrchestratorError::StateCorruption {
            pt_id,
            message: format!("状态payload不是合法JSON: {e}"),
        })?;

    if record.version != STATE_FORMAT_VERSION {
        return Err(OrchestratorError::StateCorruption {
            pt_id,
            message: format!(
                "不支持的状态格式版本 {}（当前支持 {STATE_FORMAT_VERSION}）",
                record.version
            ),
        });
    }

    if !record.subdomains.is_consistent() {
        return Err(OrchestratorError::StateCorruption {
            pt_id,
            message: format!(
                "子域名计数不一致: done={} failed={} running={} total={}",
                record.subdomains.done,
                record.subdomains.failed,
                record.subdomains.running,
                record.subdomains.total
            ),
        });
    }

    Ok(Some(record))
}

/// 把记录编码回原文：精确替换标记块覆盖的区间，其余字节不动；
/// 原文没有块时在末尾追加一个。
pub fn encode(record: &PtRecord, raw: &str) -> OrchestratorResult<String> {
    let payload = serde_json::to_string(record)
        .map_err(|e| OrchestratorError::Serialization(format!("状态记录序列化失败: {e}")))?;
    let block = format!("{STATE_BLOCK_START}\n{payload}\n{STATE_BLOCK_END}");

    match locate_block(raw) {
        Some((span, _)) => {
            let mut out = String::with_capacity(raw.len() + block.len());
            out.push_str(&raw[..span.start]);
            out.push_str(&block);
            out.push_str(&raw[span.end..]);
            Ok(out)
        }
        None => {
            let mut out = String::with_capacity(raw.len() + block.len() + 1);
            out.push_str(raw);
            if !raw.is_empty() && !raw.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&block);
            Ok(out)
        }
    }
}

/// 带时间戳写回：统一更新 last_update 后编码
pub fn encode_at(
    record: &mut PtRecord,
    raw: &str,
    now: DateTime<Utc>,
) -> OrchestratorResult<String> {
    record.last_update = now;
    encode(record, raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{PtState, Stage};

    fn sample_record() -> PtRecord {
        let mut record = PtRecord::new_at(Utc::now());
        record.state = PtState::NmapRunning;
        record.counters.nmap_runs = 2;
        record
    }

    #[test]
    fn test_decode_no_block() {
        assert_eq!(decode(1, "只有描述文字，没有状态块").unwrap(), None);
    }

    #[test]
    fn test_decode_embedded_block_preserves_surroundings() {
        let record = sample_record();
        let payload = serde_json::to_string(&record).unwrap();
        let raw = format!("notes\n{STATE_BLOCK_START}\n{payload}\n{STATE_BLOCK_END}\ntrailer");

        let decoded = decode(42, &raw).unwrap().unwrap();
        assert_eq!(decoded.state, PtState::NmapRunning);
        assert_eq!(decoded.counters.nmap_runs, 2);
        assert_eq!(decoded.retry_count, 0);
        assert!(decoded.last_error.is_none());

        // 重编码后块外的字节逐一保留
        let reencoded = encode(&decoded, &raw).unwrap();
        assert!(reencoded.starts_with("notes\n"));
        assert!(reencoded.ends_with("\ntrailer"));
        assert_eq!(decode(42, &reencoded).unwrap().unwrap(), decoded);
    }

    #[test]
    fn test_encode_appends_when_missing() {
        let record = sample_record();
        let raw = "客户的原始备注";
        let encoded = encode(&record, raw).unwrap();

        assert!(encoded.starts_with("客户的原始备注\n"));
        assert!(encoded.contains(STATE_BLOCK_START));
        assert_eq!(decode(1, &encoded).unwrap().unwrap(), record);
    }

    #[test]
    fn test_encode_into_empty_text() {
        let record = sample_record();
        let encoded = encode(&record, "").unwrap();
        assert!(encoded.starts_with(STATE_BLOCK_START));
        assert_eq!(decode(1, &encoded).unwrap().unwrap(), record);
    }

    #[test]
    fn test_roundtrip_is_stable() {
        let mut record = sample_record();
        record.record_failure(Stage::Acu, "scan failed", Utc::now());
        let first = encode(&record, "prefix\n").unwrap();
        let decoded = decode(7, &first).unwrap().unwrap();
        let second = encode(&decoded, &first).unwrap();
        // 同一记录重复编码不漂移
        assert_eq!(first, second);
    }

    #[test]
    fn test_decode_malformed_payload() {
        let raw = format!("x\n{STATE_BLOCK_START}\n{{not json\n{STATE_BLOCK_END}\n");
        let err = decode(9, &raw).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::StateCorruption { pt_id: 9, .. }
        ));
    }

    #[test]
    fn test_decode_missing_end_marker() {
        let raw = format!("x\n{STATE_BLOCK_START}\n{{}}");
        assert!(matches!(
            decode(3, &raw),
            Err(OrchestratorError::StateCorruption { pt_id: 3, .. })
        ));
    }

    #[test]
    fn test_decode_unsupported_version() {
        let mut record = sample_record();
        record.version = 99;
        let payload = serde_json::to_string(&record).unwrap();
        let raw = format!("{STATE_BLOCK_START}\n{payload}\n{STATE_BLOCK_END}");
        assert!(matches!(
            decode(5, &raw),
            Err(OrchestratorError::StateCorruption { pt_id: 5, .. })
        ));
    }

    #[test]
    fn test_decode_inconsistent_counters() {
        let mut record = sample_record();
        record.subdomains.total = 3;
        record.subdomains.done = 2;
        record.subdomains.failed = 1;
        record.subdomains.running = 1;
        let payload = serde_json::to_string(&record).unwrap();
        let raw = format!("{STATE_BLOCK_START}\n{payload}\n{STATE_BLOCK_END}");
        assert!(matches!(
            decode(6, &raw),
            Err(OrchestratorError::StateCorruption { pt_id: 6, .. })
        ));
    }
}
