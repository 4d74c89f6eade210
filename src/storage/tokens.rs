//! Stored access tokens.
//!
//! Tokens are issued by the API layer; this module only lists and revokes
//! what is stored.

use rusqlite::{params, Connection};

use super::error::StorageError;
use crate::model::AccessToken;

/// All stored tokens, ordered by name.
pub fn list_tokens(conn: &Connection) -> Result<Vec<AccessToken>, StorageError> {
    let mut stmt = conn.prepare("SELECT token, name FROM access_token ORDER BY name, token")?;
    let tokens = stmt
        .query_map([], |row| {
            Ok(AccessToken {
                token: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tokens)
}

/// Delete a token. Returns false if it did not exist.
pub fn revoke_token(conn: &Connection, token: &str) -> Result<bool, StorageError> {
    let deleted = conn.execute("DELETE FROM access_token WHERE token = ?1", params![token])?;
    if deleted > 0 {
        tracing::info!(token, "Revoked access token");
    }
    Ok(deleted > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::batch::{Batch, Batcher};
    use crate::storage::schema::initialize_schema;

    #[test]
    fn test_list_and_revoke() {
        let mut conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        let tokens = vec![
            AccessToken {
                token: "t-2".into(),
                name: "scanner-b".into(),
            },
            AccessToken {
                token: "t-1".into(),
                name: "scanner-a".into(),
            },
        ];
        Batcher::default()
            .upsert(&mut conn, &Batch::from_entities(tokens))
            .unwrap();

        let names: Vec<String> = list_tokens(&conn)
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["scanner-a", "scanner-b"]);

        assert!(revoke_token(&conn, "t-1").unwrap());
        assert!(!revoke_token(&conn, "t-1").unwrap());
        assert_eq!(list_tokens(&conn).unwrap().len(), 1);
    }
}
