//! 在庫アイテム管理用HTTP APIサーバー
//!
//! 本バイナリは以下の機能を提供する:
//! - アイテムの一覧取得 (GET /api/items)
//! - アイテムの追加 (POST /api/items)
//! - アイテムの更新 (PUT /api/items/{id})
//! - アイテムの削除 (DELETE /api/items/{id})
//! - ヘルスチェック (GET /health)
//! - 静的ファイル配信（ブラウザ用エントリページ等）

mod error;
mod store;

pub use error::ApiError;
pub use store::{
    EntryValue, InsertOutcome, InventoryStore, Item, StoreError, UpdateOutcome, coerce_entries,
};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// データベースパス環境変数名
const DB_PATH_ENV: &str = "DB_PATH";

/// デフォルトのデータベースパス
const DEFAULT_DB_PATH: &str = "./inventory.db";

/// リッスンポート（固定）
const PORT: u16 = 3000;

/// 静的アセット（ブラウザ用エントリページ等）の配信ルート
///
/// プロセスの作業ディレクトリをそのまま配信する。
const ASSETS_DIR: &str = ".";

/// アプリケーション状態
///
/// ルーター全体で共有される状態を保持する。
/// ストアは明示的に所有されたコンテキストとして各ハンドラーに注入される。
#[derive(Clone)]
pub struct AppState {
    /// SQLite在庫ストア
    pub store: Arc<InventoryStore>,
}

/// アイテム追加・更新リクエストのボディ
///
/// `count`/`remarks`は強制前の生の値として受け取る。
/// 配列でない値の空シーケンスへの強制はハンドラー側で行う。
#[derive(Debug, Clone, Deserialize)]
pub struct ItemPayload {
    /// アイテムコード（必須）
    #[serde(default)]
    pub code: Option<String>,
    /// countシーケンス（任意）
    #[serde(default)]
    pub count: Option<serde_json::Value>,
    /// remarksシーケンス（任意）
    #[serde(default)]
    pub remarks: Option<serde_json::Value>,
}

/// アイテム追加成功レスポンスのボディ
///
/// `count`/`remarks`はリクエストで受け取った強制前の値をそのまま返す。
/// 保存される値（強制後）とは一致しないことがある。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateItemResponse {
    /// 成功フラグ
    pub success: bool,
    /// 確認メッセージ
    pub message: String,
    /// ストアが採番したID
    pub id: i64,
    /// アイテムコード
    pub code: String,
    /// リクエストのcount値のエコー
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<serde_json::Value>,
    /// リクエストのremarks値のエコー
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remarks: Option<serde_json::Value>,
}

/// 更新・削除成功レスポンスのボディ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationResponse {
    /// 成功フラグ
    pub success: bool,
    /// 確認メッセージ
    pub message: String,
}

/// ヘルスチェックエンドポイント
///
/// サーバーの死活確認用。
async fn health() -> &'static str {
    "OK"
}

/// アイテム一覧エンドポイント (GET /api/items)
///
/// 全アイテムを取得し、JSON配列として返す。並び順はストレージ依存。
///
/// # Returns
/// - 200 OK: アイテムのJSON配列
/// - 500 Internal Server Error: データベースエラー（元のメッセージを含む）
async fn list_items(State(state): State<AppState>) -> Response {
    match state.store.list_items().await {
        Ok(items) => {
            tracing::info!(count = items.len(), "アイテム一覧を返却");
            Json(items).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "アイテム一覧取得エラー");
            ApiError::internal_error(e.to_string()).into_response()
        }
    }
}

/// アイテム追加エンドポイント (POST /api/items)
///
/// 新しいアイテムを追加する。IDはストアが採番する。
/// 配列でない`count`/`remarks`は空シーケンスに強制して保存するが、
/// レスポンスには強制前のリクエスト値をそのままエコーする。
///
/// # Returns
/// - 201 Created: 追加成功（採番されたIDを含む）
/// - 400 Bad Request: アイテムコードの欠落、またはリクエストボディが不正
/// - 409 Conflict: アイテムコードが既に存在
/// - 500 Internal Server Error: データベースエラー
async fn create_item(State(state): State<AppState>, Json(payload): Json<ItemPayload>) -> Response {
    let Some(code) = payload.code.as_deref().filter(|c| !c.is_empty()) else {
        tracing::warn!("アイテムコードなしの追加リクエストを拒否");
        return ApiError::bad_request("アイテムコードは必須です").into_response();
    };

    let count = coerce_entries(payload.count.as_ref());
    let remarks = coerce_entries(payload.remarks.as_ref());

    match state.store.insert_item(code, &count, &remarks).await {
        Ok(InsertOutcome::Created(id)) => {
            tracing::info!(id, code = %code, "アイテムを新規作成");
            let body = CreateItemResponse {
                success: true,
                message: "アイテムを追加しました".to_string(),
                id,
                code: code.to_string(),
                count: payload.count.clone(),
                remarks: payload.remarks.clone(),
            };
            (StatusCode::CREATED, Json(body)).into_response()
        }
        Ok(InsertOutcome::CodeTaken) => {
            tracing::warn!(code = %code, "アイテムコードが重複");
            ApiError::conflict("アイテムコードが既に存在します").into_response()
        }
        Err(e) => {
            tracing::error!(code = %code, error = %e, "アイテム追加エラー");
            ApiError::internal_error(e.to_string()).into_response()
        }
    }
}

/// アイテム更新エンドポイント (PUT /api/items/{id})
///
/// IDをキーとして全フィールドを置換する。
/// `count`/`remarks`の強制ルールは追加時と同じで、保存されるのは強制後の値。
///
/// # Returns
/// - 200 OK: 更新成功
/// - 400 Bad Request: アイテムコードの欠落、またはリクエストボディが不正
/// - 404 Not Found: 対象のアイテムが存在しない
/// - 409 Conflict: アイテムコードが別のアイテムに使用されている
/// - 500 Internal Server Error: データベースエラー
async fn update_item_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<ItemPayload>,
) -> Response {
    let Some(code) = payload.code.as_deref().filter(|c| !c.is_empty()) else {
        tracing::warn!(id, "アイテムコードなしの更新リクエストを拒否");
        return ApiError::bad_request("アイテムコードは必須です").into_response();
    };

    let count = coerce_entries(payload.count.as_ref());
    let remarks = coerce_entries(payload.remarks.as_ref());

    match state.store.update_item(id, code, &count, &remarks).await {
        Ok(UpdateOutcome::Updated) => {
            tracing::info!(id, code = %code, "アイテムを更新");
            Json(ConfirmationResponse {
                success: true,
                message: "アイテムを更新しました".to_string(),
            })
            .into_response()
        }
        Ok(UpdateOutcome::NotFound) => {
            tracing::warn!(id, "更新対象のアイテムが見つからない");
            ApiError::not_found("アイテムが見つかりません").into_response()
        }
        Ok(UpdateOutcome::CodeTaken) => {
            tracing::warn!(id, code = %code, "アイテムコードが重複");
            ApiError::conflict("アイテムコードが既に存在します").into_response()
        }
        Err(e) => {
            tracing::error!(id, error = %e, "アイテム更新エラー");
            ApiError::internal_error(e.to_string()).into_response()
        }
    }
}

/// アイテム削除エンドポイント (DELETE /api/items/{id})
///
/// 指定されたIDのアイテムを削除する。
///
/// # Returns
/// - 200 OK: 削除成功
/// - 404 Not Found: アイテムが存在しない
/// - 500 Internal Server Error: データベースエラー
async fn delete_item_handler(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.delete_item(id).await {
        Ok(true) => {
            tracing::info!(id, "アイテムを削除");
            Json(ConfirmationResponse {
                success: true,
                message: "アイテムを削除しました".to_string(),
            })
            .into_response()
        }
        Ok(false) => {
            tracing::warn!(id, "削除対象のアイテムが見つからない");
            ApiError::not_found("アイテムが見つかりません").into_response()
        }
        Err(e) => {
            tracing::error!(id, error = %e, "アイテム削除エラー");
            ApiError::internal_error(e.to_string()).into_response()
        }
    }
}

/// ルーターを構築する
///
/// 全エンドポイントのルーティングを定義する。
/// APIルートに該当しないパスは静的ファイル配信にフォールバックする。
/// TraceLayerによりリクエスト/レスポンスの構造化ログを自動記録する。
///
/// # Arguments
/// * `store` - SQLite在庫ストア
pub fn create_router_with_store(store: Arc<InventoryStore>) -> Router {
    let state = AppState { store };

    Router::new()
        .route("/health", get(health))
        .route("/api/items", get(list_items).post(create_item))
        .route(
            "/api/items/{id}",
            put(update_item_handler).delete(delete_item_handler),
        )
        // 静的アセット（ブラウザ用エントリページ等）
        .fallback_service(ServeDir::new(ASSETS_DIR))
        // ブラウザの静的ページからのAPI呼び出しを許可
        .layer(CorsLayer::permissive())
        // リクエストトレーシングレイヤー（method, path, status, latencyを自動記録）
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// シャットダウンシグナルを待機する
///
/// SIGTERMまたはCtrl+C (SIGINT) を待機し、いずれかを受信したらリターンする。
/// axum::serve の with_graceful_shutdown() と組み合わせて使用することで、
/// 新規リクエストの受付停止と処理中リクエストの完了待機を実現する。
///
/// # Panics
/// シグナルハンドラーの登録に失敗した場合はパニックする。
async fn shutdown_signal() {
    // Ctrl+C (SIGINT) を待機
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Ctrl+C シグナルハンドラーの登録に失敗しました");
    };

    // SIGTERM を待機 (Unix系OSのみ)
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM シグナルハンドラーの登録に失敗しました")
            .recv()
            .await;
    };

    // Windows等の非Unix環境ではSIGTERMは利用不可
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C (SIGINT) を受信しました。graceful shutdownを開始します");
        }
        _ = terminate => {
            tracing::info!("SIGTERM を受信しました。graceful shutdownを開始します");
        }
    }
}

/// メイン関数
///
/// トレーシングを初期化し、HTTPサーバーを起動する。
/// サーバーはlocalhost:3000でリッスンする（ポートは固定）。
/// SIGTERMまたはCtrl+Cを受信するとgraceful shutdownを実行し、
/// 処理中のリクエスト完了を待ってからSQLite接続をベストエフォートでクローズする。
///
/// # 環境変数
/// - `DB_PATH`: データベースファイルのパス（デフォルト: ./inventory.db）
/// - `RUST_LOG`: ログレベル（デフォルト: info）
#[tokio::main]
async fn main() {
    // 構造化ログの初期化
    // RUST_LOG環境変数でログレベルを制御（デフォルト: info）
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("在庫APIサーバーを起動します");

    // データベースパスを環境変数から取得
    let db_path = std::env::var(DB_PATH_ENV).unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
    tracing::info!("データベースパス: {}", db_path);

    // SQLite在庫ストアを初期化
    // スキーマ初期化の失敗は起動失敗として扱う（fail-fast）
    let store = Arc::new(
        InventoryStore::new(&db_path)
            .await
            .expect("SQLiteストアの初期化に失敗しました"),
    );
    tracing::info!("SQLiteストアを初期化しました");

    let app = create_router_with_store(store.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], PORT));
    tracing::info!("リッスン開始: {}", addr);
    tracing::info!("ブラウザで http://{} を開いてください", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("アドレスのバインドに失敗しました");

    // graceful shutdownを有効にしてサーバーを起動
    // shutdown_signal()がシグナルを受信すると:
    // 1. 新規コネクションの受付を停止
    // 2. 処理中のリクエストの完了を待機
    // 3. サーバーが終了し、以下で書き込み接続を明示的にクローズする
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("サーバーの起動に失敗しました");

    // ベストエフォートのクローズ。失敗はログのみでリトライしない
    match Arc::try_unwrap(store) {
        Ok(store) => match store.close() {
            Ok(()) => tracing::info!("データベース接続をクローズしました"),
            Err(e) => tracing::warn!(error = %e, "データベース接続のクローズに失敗"),
        },
        Err(_) => {
            tracing::warn!("ストアがまだ参照されているためクローズをスキップ");
        }
    }

    tracing::info!("サーバーが正常に停止しました");
}



#[cfg(test)]
mod graceful_shutdown_tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::oneshot;

    /// テスト用の一時データベースパスを生成
    fn temp_db_path() -> (tempfile::TempDir, String) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        (dir, path.to_string_lossy().to_string())
    }

    /// graceful shutdownを使用したサーバーが正常に起動・停止できることを確認
    #[tokio::test]
    async fn test_server_with_graceful_shutdown_starts_and_stops() {
        let (dir, db_path) = temp_db_path();
        let store = Arc::new(InventoryStore::new(&db_path).await.unwrap());
        let app = create_router_with_store(store);

        // ランダムポートでリッスン
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // シャットダウンシグナル用のチャネル
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        // サーバーをバックグラウンドで起動
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                    tracing::info!("テスト用シャットダウンシグナルを受信");
                })
                .await
                .expect("サーバーの起動に失敗");
        });

        // サーバーが起動するまで少し待機
        tokio::time::sleep(Duration::from_millis(100)).await;

        // ヘルスチェックでサーバーが動作していることを確認
        let client = reqwest::Client::new();
        let response = client
            .get(format!("http://{}/health", addr))
            .send()
            .await
            .expect("ヘルスチェックリクエストに失敗");
        assert_eq!(response.status(), 200);

        // シャットダウンシグナルを送信
        shutdown_tx.send(()).expect("シャットダウンシグナル送信に失敗");

        // サーバーが正常に停止するのを待機（タイムアウト付き）
        let shutdown_result = tokio::time::timeout(Duration::from_secs(5), server_handle).await;
        assert!(
            shutdown_result.is_ok(),
            "サーバーが5秒以内に停止しなかった"
        );
        assert!(
            shutdown_result.unwrap().is_ok(),
            "サーバーがエラーで停止した"
        );

        // tempディレクトリが削除されないように保持
        drop(dir);
    }

    /// graceful shutdown後にストアをクローズできることを確認
    #[tokio::test]
    async fn test_store_closes_after_graceful_shutdown() {
        let (dir, db_path) = temp_db_path();
        let store = Arc::new(InventoryStore::new(&db_path).await.unwrap());
        let app = create_router_with_store(store.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let server_handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("サーバーの起動に失敗");
        });

        tokio::time::sleep(Duration::from_millis(100)).await;

        // サーバー経由でアイテムを追加
        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{}/api/items", addr))
            .header("content-type", "application/json")
            .body(r#"{"code":"SHUTDOWN-1","count":[1],"remarks":[]}"#)
            .send()
            .await
            .expect("追加リクエストに失敗");
        assert_eq!(response.status(), 201);

        shutdown_tx.send(()).ok();
        let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

        // サーバー停止後はこのArcが唯一の参照になり、クローズできる
        let store = Arc::try_unwrap(store).unwrap_or_else(|_| {
            panic!("サーバー停止後もストアが共有されている");
        });
        assert!(store.close().is_ok(), "シャットダウン後のクローズに失敗");

        drop(dir);
    }

    /// shutdown_signal関数が存在し、適切な型を返すことを確認
    /// (実際のシグナルを送信するテストは統合テストで行う)
    #[test]
    fn test_shutdown_signal_function_exists() {
        // shutdown_signal関数が存在し、コンパイルできることを確認
        // 実際の呼び出しはシグナルを待機するため、ここでは型チェックのみ
        fn _check_shutdown_signal_type() -> impl std::future::Future<Output = ()> {
            shutdown_signal()
        }
    }
}
