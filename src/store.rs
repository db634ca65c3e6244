//! SQLite在庫ストア
//!
//! 在庫アイテムの一覧取得・追加・更新・削除機能を提供する。
//! - 書き込み: 専用の単一接続（Arc<Mutex<Connection>>）
//! - 読み取り: deadpool-sqliteによるasync接続プール

use std::sync::{Arc, Mutex};

use deadpool_sqlite::{Config, Pool, Runtime};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ストアエラー
#[derive(Debug, Error)]
pub enum StoreError {
    /// データベースエラー
    #[error("データベースエラー: {0}")]
    Database(String),

    /// プール取得エラー
    #[error("プールエラー: {0}")]
    Pool(String),

    /// 接続構築エラー
    #[error("接続構築エラー: {0}")]
    Build(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<deadpool_sqlite::BuildError> for StoreError {
    fn from(err: deadpool_sqlite::BuildError) -> Self {
        StoreError::Build(err.to_string())
    }
}

impl From<deadpool_sqlite::PoolError> for StoreError {
    fn from(err: deadpool_sqlite::PoolError) -> Self {
        StoreError::Pool(err.to_string())
    }
}

impl From<deadpool_sqlite::InteractError> for StoreError {
    fn from(err: deadpool_sqlite::InteractError) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// 追加結果
///
/// アイテム追加操作の結果を表す。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// 新規作成された（ストアが採番したIDを含む）
    Created(i64),
    /// アイテムコードが既に使用されていた
    CodeTaken,
}

/// 更新結果
///
/// アイテム更新操作の結果を表す。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// 更新された
    Updated,
    /// 対象のアイテムが存在しなかった
    NotFound,
    /// アイテムコードが別のアイテムに使用されていた
    CodeTaken,
}

/// シーケンス要素
///
/// count/remarksシーケンスの要素。数値または文字列のみを許容する。
/// untagged表現のため、JSON配列 `[1, "a"]` はそのままの形で往復する。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EntryValue {
    /// 数値要素
    Number(serde_json::Number),
    /// 文字列要素
    Text(String),
}

/// 在庫アイテム
///
/// HTTP APIのレスポンスで使用する唯一のエンティティ。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    /// ストアが採番する不変ID
    pub id: i64,
    /// アイテムコード（全アイテムで一意、大文字小文字を区別）
    pub code: String,
    /// countシーケンス
    pub count: Vec<EntryValue>,
    /// remarksシーケンス
    pub remarks: Vec<EntryValue>,
}

/// リクエスト値をシーケンスに強制する
///
/// 欠落している値、配列でない値、数値・文字列以外の要素を含む配列は
/// すべて空シーケンスとして扱う。保存されるカラムが常に有効な
/// シリアライズ済みシーケンスであることをこの一箇所で保証する。
pub fn coerce_entries(value: Option<&serde_json::Value>) -> Vec<EntryValue> {
    value
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

/// 保存されたJSON文字列をシーケンスに復元する
///
/// NULLカラムおよびパースできない文字列は空シーケンスとして扱う。
fn decode_entries(json: Option<&str>) -> Vec<EntryValue> {
    json.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

/// UNIQUE制約違反かどうかを判定する
///
/// itemsテーブルのUNIQUE制約はcodeカラムのみのため、
/// この判定はコード重複と等価になる。
fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// SQLite在庫ストア
///
/// - 書き込み: 専用の単一接続（Arc<Mutex<Connection>>）
/// - 読み取り: deadpool-sqliteによるasync接続プール
pub struct InventoryStore {
    /// 書き込み専用接続（低頻度のため単一接続で十分）
    write_conn: Arc<Mutex<Connection>>,
    /// 読み取り用async接続プール
    read_pool: Pool,
}

/// SQLiteデータベースのスキーマを定義するSQL
const SCHEMA_SQL: &str = r#"
-- WALモード設定
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;

-- 在庫アイテムテーブル
CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,  -- ストアが採番する不変ID
    code TEXT NOT NULL UNIQUE,             -- アイテムコード
    count_json TEXT,                       -- countシーケンスのJSON文字列
    remarks_json TEXT                      -- remarksシーケンスのJSON文字列
);
"#;

impl InventoryStore {
    /// 新しいInventoryStoreを作成
    ///
    /// データベースファイルを開き、スキーマを初期化する。
    /// WALモードを有効にし、書き込み用単一接続と読み取り用プールを構成する。
    /// スキーマ初期化の失敗はErrとして呼び出し元に伝搬する（fail-fast）。
    ///
    /// # Arguments
    /// * `db_path` - データベースファイルのパス
    ///
    /// # Returns
    /// * `Ok(InventoryStore)` - 成功時
    /// * `Err(StoreError)` - エラー時
    pub async fn new(db_path: &str) -> Result<Self, StoreError> {
        // 書き込み用接続を作成し、スキーマを初期化
        let write_conn = Connection::open(db_path)?;
        write_conn.execute_batch(SCHEMA_SQL)?;

        // 読み取り用プールを作成（最大4接続）
        // builder()はInfallibleを返すためunwrap()相当のexpectを使用
        let cfg = Config::new(db_path);
        let read_pool = cfg
            .builder(Runtime::Tokio1)
            .expect("Config builder should not fail")
            .max_size(4)
            .build()?;

        Ok(Self {
            write_conn: Arc::new(Mutex::new(write_conn)),
            read_pool,
        })
    }

    /// 全アイテムを取得
    ///
    /// 読み取りプールから接続を取得し、並行実行可能。
    /// ORDER BYは適用しない（並び順はストレージ依存）。
    /// NULLまたはパース不能なカラムは空シーケンスとして復元される。
    ///
    /// # Returns
    /// * `Ok(Vec<Item>)` - 全アイテムのリスト
    /// * `Err(StoreError)` - エラー
    pub async fn list_items(&self) -> Result<Vec<Item>, StoreError> {
        let conn = self.read_pool.get().await?;

        conn.interact(|conn| Self::fetch_all(conn)).await?
    }

    /// 全件取得クエリを実行（内部用）
    fn fetch_all(conn: &Connection) -> Result<Vec<Item>, StoreError> {
        let mut stmt = conn.prepare("SELECT id, code, count_json, remarks_json FROM items")?;

        let items: Vec<Item> = stmt
            .query_map([], |row| {
                Ok(Item {
                    id: row.get(0)?,
                    code: row.get(1)?,
                    count: decode_entries(row.get::<_, Option<String>>(2)?.as_deref()),
                    remarks: decode_entries(row.get::<_, Option<String>>(3)?.as_deref()),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(items)
    }

    /// アイテムを追加
    ///
    /// 書き込み専用接続を使用する。IDはストアが採番する。
    /// codeのUNIQUE制約違反は`InsertOutcome::CodeTaken`として返し、
    /// 既存行を上書きすることはない。
    ///
    /// # Arguments
    /// * `code` - アイテムコード
    /// * `count` - 保存するcountシーケンス（強制済み）
    /// * `remarks` - 保存するremarksシーケンス（強制済み）
    ///
    /// # Returns
    /// * `Ok(InsertOutcome::Created(id))` - 新規作成成功
    /// * `Ok(InsertOutcome::CodeTaken)` - コード重複
    /// * `Err(StoreError)` - エラー
    pub async fn insert_item(
        &self,
        code: &str,
        count: &[EntryValue],
        remarks: &[EntryValue],
    ) -> Result<InsertOutcome, StoreError> {
        let code = code.to_string();
        let count_json = serde_json::to_string(count)
            .map_err(|e| StoreError::Database(format!("JSON シリアライズエラー: {}", e)))?;
        let remarks_json = serde_json::to_string(remarks)
            .map_err(|e| StoreError::Database(format!("JSON シリアライズエラー: {}", e)))?;
        let conn = self.write_conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .expect("アイテム追加時の書き込み接続ロック取得に失敗（Mutex poisoned）");

            match conn.execute(
                "INSERT INTO items (code, count_json, remarks_json) VALUES (?1, ?2, ?3)",
                rusqlite::params![&code, &count_json, &remarks_json],
            ) {
                Ok(_) => Ok(InsertOutcome::Created(conn.last_insert_rowid())),
                Err(err) if is_unique_violation(&err) => Ok(InsertOutcome::CodeTaken),
                Err(err) => Err(StoreError::from(err)),
            }
        })
        .await
        .map_err(|e| StoreError::Database(format!("タスク実行エラー: {}", e)))?
    }

    /// アイテムを更新
    ///
    /// IDをキーとして全フィールドを置換する。IDは変更されない。
    /// 対象行が存在しない場合は`UpdateOutcome::NotFound`、
    /// 新しいcodeが別のアイテムと重複する場合は`UpdateOutcome::CodeTaken`を返す。
    /// 自身の現在のcodeへの更新は重複とならず成功する。
    ///
    /// # Arguments
    /// * `id` - 更新対象のアイテムID
    /// * `code` - 新しいアイテムコード
    /// * `count` - 新しいcountシーケンス（強制済み）
    /// * `remarks` - 新しいremarksシーケンス（強制済み）
    ///
    /// # Returns
    /// * `Ok(UpdateOutcome::Updated)` - 更新成功
    /// * `Ok(UpdateOutcome::NotFound)` - 対象行なし
    /// * `Ok(UpdateOutcome::CodeTaken)` - コード重複
    /// * `Err(StoreError)` - エラー
    pub async fn update_item(
        &self,
        id: i64,
        code: &str,
        count: &[EntryValue],
        remarks: &[EntryValue],
    ) -> Result<UpdateOutcome, StoreError> {
        let code = code.to_string();
        let count_json = serde_json::to_string(count)
            .map_err(|e| StoreError::Database(format!("JSON シリアライズエラー: {}", e)))?;
        let remarks_json = serde_json::to_string(remarks)
            .map_err(|e| StoreError::Database(format!("JSON シリアライズエラー: {}", e)))?;
        let conn = self.write_conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .expect("アイテム更新時の書き込み接続ロック取得に失敗（Mutex poisoned）");

            match conn.execute(
                "UPDATE items SET code = ?1, count_json = ?2, remarks_json = ?3 WHERE id = ?4",
                rusqlite::params![&code, &count_json, &remarks_json, id],
            ) {
                Ok(0) => Ok(UpdateOutcome::NotFound),
                Ok(_) => Ok(UpdateOutcome::Updated),
                Err(err) if is_unique_violation(&err) => Ok(UpdateOutcome::CodeTaken),
                Err(err) => Err(StoreError::from(err)),
            }
        })
        .await
        .map_err(|e| StoreError::Database(format!("タスク実行エラー: {}", e)))?
    }

    /// アイテムをIDで削除
    ///
    /// 書き込み専用接続を使用する。
    ///
    /// # Arguments
    /// * `id` - 削除するアイテムのID
    ///
    /// # Returns
    /// * `Ok(true)` - 削除成功
    /// * `Ok(false)` - アイテムが存在しなかった
    /// * `Err(StoreError)` - エラー
    pub async fn delete_item(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.write_conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .expect("アイテム削除時の書き込み接続ロック取得に失敗（Mutex poisoned）");

            let rows_affected = conn.execute("DELETE FROM items WHERE id = ?1", [id])?;

            Ok(rows_affected > 0)
        })
        .await
        .map_err(|e| StoreError::Database(format!("タスク実行エラー: {}", e)))?
    }

    /// ストアをクローズ
    ///
    /// シャットダウン時のベストエフォートなクローズ処理。
    /// 読み取りプールはドロップで解放され、書き込み接続は明示的にクローズする。
    /// 接続がまだ共有されている場合はエラーを返す（呼び出し元でログのみ、リトライなし）。
    ///
    /// # Returns
    /// * `Ok(())` - クローズ成功
    /// * `Err(StoreError)` - クローズ失敗
    pub fn close(self) -> Result<(), StoreError> {
        let conn = Arc::try_unwrap(self.write_conn)
            .map_err(|_| StoreError::Database("書き込み接続がまだ共有されています".to_string()))?
            .into_inner()
            .map_err(|e| StoreError::Database(format!("書き込み接続ロックの回収に失敗: {}", e)))?;

        conn.close().map_err(|(_, err)| StoreError::from(err))
    }
}
