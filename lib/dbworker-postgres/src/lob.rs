//! Large-object streaming through the server-side `lo_*` functions.
//!
//! PostgreSQL routes BLOB traffic through large-object OIDs rather than
//! parameter streaming. The `lo_*` calls are only valid inside a
//! transaction, so each helper wraps its chunk loop in begin/commit and
//! rolls back on any failure.

use dbworker::{DbError, STREAM_CHUNK_SIZE};
use sqlx::postgres::types::Oid;
use sqlx::{Executor, PgConnection, Row};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Large-object open modes (libpq INV_WRITE / INV_READ).
const INV_WRITE: i32 = 0x20000;
const INV_READ: i32 = 0x40000;

/// Create a large object and fill it from `data` in bounded chunks.
/// Returns the new object's OID.
pub(crate) async fn write_large_object(
    connection: &mut PgConnection,
    data: &mut (dyn AsyncRead + Send + Unpin),
) -> Result<u32, DbError> {
    connection
        .execute("begin")
        .await
        .map_err(|e| DbError::query(e.to_string(), "begin"))?;

    let written = write_chunks(connection, data).await;
    match written {
        Ok(oid) => {
            connection
                .execute("commit")
                .await
                .map_err(|e| DbError::query(e.to_string(), "commit"))?;
            Ok(oid)
        }
        Err(error) => {
            let _ = connection.execute("rollback").await;
            Err(error)
        }
    }
}

async fn write_chunks(
    connection: &mut PgConnection,
    data: &mut (dyn AsyncRead + Send + Unpin),
) -> Result<u32, DbError> {
    let row = sqlx::query("select lo_creat(-1)")
        .fetch_one(&mut *connection)
        .await
        .map_err(|e| DbError::query(e.to_string(), "select lo_creat(-1)"))?;
    let oid: Oid = row
        .try_get(0)
        .map_err(|e| DbError::Stream(e.to_string()))?;

    let row = sqlx::query("select lo_open($1, $2)")
        .bind(oid)
        .bind(INV_WRITE)
        .fetch_one(&mut *connection)
        .await
        .map_err(|e| DbError::query(e.to_string(), "select lo_open"))?;
    let descriptor: i32 = row
        .try_get(0)
        .map_err(|e| DbError::Stream(e.to_string()))?;

    let mut chunk = vec![0u8; STREAM_CHUNK_SIZE];
    loop {
        let read = data
            .read(&mut chunk)
            .await
            .map_err(|e| DbError::Stream(e.to_string()))?;
        if read == 0 {
            break;
        }
        sqlx::query("select lowrite($1, $2)")
            .bind(descriptor)
            .bind(&chunk[..read])
            .execute(&mut *connection)
            .await
            .map_err(|e| DbError::query(e.to_string(), "select lowrite"))?;
    }

    sqlx::query("select lo_close($1)")
        .bind(descriptor)
        .execute(&mut *connection)
        .await
        .map_err(|e| DbError::query(e.to_string(), "select lo_close"))?;

    Ok(oid.0)
}

/// Read a large object's full contents in bounded chunks.
pub(crate) async fn read_large_object(
    connection: &mut PgConnection,
    oid: u32,
) -> Result<Vec<u8>, DbError> {
    connection
        .execute("begin")
        .await
        .map_err(|e| DbError::query(e.to_string(), "begin"))?;

    let contents = read_chunks(connection, oid).await;
    match contents {
        Ok(bytes) => {
            connection
                .execute("commit")
                .await
                .map_err(|e| DbError::query(e.to_string(), "commit"))?;
            Ok(bytes)
        }
        Err(error) => {
            let _ = connection.execute("rollback").await;
            Err(error)
        }
    }
}

async fn read_chunks(connection: &mut PgConnection, oid: u32) -> Result<Vec<u8>, DbError> {
    let row = sqlx::query("select lo_open($1, $2)")
        .bind(Oid(oid))
        .bind(INV_READ)
        .fetch_one(&mut *connection)
        .await
        .map_err(|e| DbError::query(e.to_string(), "select lo_open"))?;
    let descriptor: i32 = row
        .try_get(0)
        .map_err(|e| DbError::Stream(e.to_string()))?;

    let mut contents = Vec::new();
    loop {
        let row = sqlx::query("select loread($1, $2)")
            .bind(descriptor)
            .bind(STREAM_CHUNK_SIZE as i32)
            .fetch_one(&mut *connection)
            .await
            .map_err(|e| DbError::query(e.to_string(), "select loread"))?;
        let chunk: Vec<u8> = row
            .try_get(0)
            .map_err(|e| DbError::Stream(e.to_string()))?;
        if chunk.is_empty() {
            break;
        }
        contents.extend_from_slice(&chunk);
    }

    sqlx::query("select lo_close($1)")
        .bind(descriptor)
        .execute(&mut *connection)
        .await
        .map_err(|e| DbError::query(e.to_string(), "select lo_close"))?;

    Ok(contents)
}
