//! 内置 PII 类别与匹配模式

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Pattern, RawMatch};

// ============================================================================
// 类别定义
// ============================================================================

/// 匹配强度
///
/// 弱类别只是提示，下游需要降低其置信度。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    #[default]
    Strong,
    Weak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PiiCategory {
    Email,
    Phone,
    CreditCard,
    NationalId,
    PersonName,
    Prefecture,
    AddressHint,
    PostalCode,
}

impl PiiCategory {
    pub const ALL: [PiiCategory; 8] = [
        PiiCategory::Email,
        PiiCategory::Phone,
        PiiCategory::CreditCard,
        PiiCategory::NationalId,
        PiiCategory::PersonName,
        PiiCategory::Prefecture,
        PiiCategory::AddressHint,
        PiiCategory::PostalCode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PiiCategory::Email => "EMAIL",
            PiiCategory::Phone => "PHONE",
            PiiCategory::CreditCard => "CREDIT_CARD",
            PiiCategory::NationalId => "NATIONAL_ID",
            PiiCategory::PersonName => "PERSON_NAME",
            PiiCategory::Prefecture => "PREFECTURE",
            PiiCategory::AddressHint => "ADDRESS_HINT",
            PiiCategory::PostalCode => "POSTAL_CODE",
        }
    }

    pub fn strength(&self) -> Strength {
        match self {
            PiiCategory::Email
            | PiiCategory::Phone
            | PiiCategory::CreditCard
            | PiiCategory::NationalId => Strength::Strong,
            PiiCategory::PersonName
            | PiiCategory::Prefecture
            | PiiCategory::AddressHint
            | PiiCategory::PostalCode => Strength::Weak,
        }
    }

    /// 该类别对应的匹配模式
    pub fn pattern(&self) -> Pattern {
        match self {
            PiiCategory::Email => Pattern::Regex(EMAIL.clone()),
            PiiCategory::Phone => Pattern::Regex(PHONE.clone()),
            PiiCategory::CreditCard => Pattern::Regex(CREDIT_CARD.clone()),
            PiiCategory::NationalId => Pattern::Regex(NATIONAL_ID.clone()),
            PiiCategory::PersonName => Pattern::Regex(PERSON_NAME.clone()),
            PiiCategory::AddressHint => Pattern::Regex(ADDRESS_HINT.clone()),
            PiiCategory::PostalCode => Pattern::Regex(POSTAL_CODE.clone()),
            PiiCategory::Prefecture => {
                Pattern::Lexicon(PREFECTURES.iter().map(|p| p.to_string()).collect())
            }
        }
    }
}

impl std::fmt::Display for PiiCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// 正则
// ============================================================================

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").expect("email pattern")
});

static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([0-9]{2,4}[-\s]?)?[0-9]{3,4}[-\s]?[0-9]{4}").expect("phone pattern")
});

static CREDIT_CARD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9]{4}[\s-]?[0-9]{4}[\s-]?[0-9]{4}[\s-]?[0-9]{4}").expect("card pattern")
});

// 个人编号：3-4-4 位
static NATIONAL_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9]{3}[-\s]?[0-9]{4}[-\s]?[0-9]{4}").expect("national id pattern")
});

static PERSON_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Z][a-z]+\s[A-Z][a-z]+").expect("name pattern"));

static ADDRESS_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(住所|番地|号|丁目|番町)").expect("address hint pattern"));

static POSTAL_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9]{3}[-\s]?[0-9]{4}").expect("postal code pattern"));

// ============================================================================
// 都道府县词典
// ============================================================================

pub const PREFECTURES: [&str; 47] = [
    "北海道", "青森県", "岩手県", "宮城県", "秋田県", "山形県", "福島県",
    "茨城県", "栃木県", "群馬県", "埼玉県", "千葉県", "東京都", "神奈川県",
    "新潟県", "富山県", "石川県", "福井県", "山梨県", "長野県", "岐阜県",
    "静岡県", "愛知県", "三重県", "滋賀県", "京都府", "大阪府", "兵庫県",
    "奈良県", "和歌山県", "鳥取県", "島根県", "岡山県", "広島県", "山口県",
    "徳島県", "香川県", "愛媛県", "高知県", "福岡県", "佐賀県", "長崎県",
    "熊本県", "大分県", "宮崎県", "鹿児島県", "沖縄県",
];

/// 在文本中查找某一类别的所有匹配（字节偏移）
pub fn find(category: PiiCategory, text: &str) -> Vec<RawMatch> {
    if text.is_empty() {
        return Vec::new();
    }
    category.pattern().find_all(text)
}
