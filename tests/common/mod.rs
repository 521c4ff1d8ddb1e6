#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use yuanjing_forensics::{CorpusSnapshot, FingerprintEngine, ForensicPolicy};

pub fn at(minute: i64) -> DateTime<Utc> {
    // 2026-05-05 是周二，10:00 UTC 处于工作时间
    Utc.with_ymd_and_hms(2026, 5, 5, 10, 0, 0).unwrap() + Duration::minutes(minute)
}

pub fn loan(amount: u64) -> Value {
    json!({
        "loan_id": "LN-2026-0042",
        "loan_amount": amount,
        "interest_rate": 6.25,
        "borrower": {
            "name": "Jane Applicant",
            "email": "jane@example.com",
            "ssn": "123-45-6789"
        },
        "approval_status": "pending",
        "closing_date": "2026-06-01"
    })
}

/// 结构相同、内容各异的表单
pub fn tax_form(i: usize) -> Value {
    json!({
        "form_type": "w2",
        "employee": format!("applicant{i:04}"),
        "employer": format!("employer{:04}", i * 7),
        "wages": 40_000 + i * 113,
        "tax_year": 2025
    })
}

pub fn template_corpus(n: usize) -> CorpusSnapshot {
    let engine = FingerprintEngine::new(&ForensicPolicy::default());
    let mut snapshot = CorpusSnapshot::new(at(24 * 60));
    for i in 0..n {
        let fp = engine
            .fingerprint(&format!("w2-{i:03}"), &tax_form(i))
            .expect("fingerprint");
        snapshot.fingerprints.push(fp);
    }
    snapshot
}
