//! The workspace client: one authenticated connection, with the
//! chunked-transfer conversations and the key-distribution and
//! signing protocols built on top of it.

use rsa::{RsaPrivateKey, RsaPublicKey};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::Error;
use crate::crypto;
use crate::definitions::{
    CHUNK_SIZE, WrappedKeyRecord, key_record_name, signature_name, signer_of, valid_target_name,
};
use crate::transfer::chunk_count;
use crate::transport;
use crate::wire::{
    self, Body, HDR_CHUNK_ID, HDR_FILE_ID, HDR_TYPE, Message, Status, TYPE_CHUNK, TYPE_SIGNATURE,
};

pub use keyring::KeyRing;

mod keyring;

/// A client over the standard TLS transport.
pub type TlsClient = Client<tokio_rustls::client::TlsStream<TcpStream>>;

/// An authenticated connection to a workspace server.
pub struct Client<S> {
    stream: S,
    identity: String,
}

impl Client<tokio_rustls::client::TlsStream<TcpStream>> {
    /// Open a TLS connection and authenticate. The boolean is true
    /// when the server created the account on this exchange.
    pub async fn connect(
        address: &str,
        server_name: &str,
        root_ca: &Path,
        id: &str,
        secret: &str,
    ) -> Result<(Self, bool), Error> {
        let connector = transport::connector(root_ca)?;
        let stream = transport::connect(&connector, address, server_name).await?;
        Client::handshake(stream, id, secret).await
    }
}

fn accepted(response: &Message) -> Result<(), Error> {
    match response.status() {
        Some(status) if status.is_accept() => Ok(()),
        Some(status) => Err(Error::UnexpectedStatus(status)),
        None => Err(Error::Protocol("request frame where a response was expected")),
    }
}

fn required<'a>(response: &'a Message, key: &'static str) -> Result<&'a str, Error> {
    response.field(key).ok_or(Error::MissingField(key))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the credential exchange over an established stream.
    pub async fn handshake(mut stream: S, id: &str, secret: &str) -> Result<(Self, bool), Error> {
        let request = Message::request("authenticate")
            .with_field("id", id)
            .with_field("secret", secret);
        wire::write_message(&mut stream, &request).await?;
        let response = wire::read_response(&mut stream)
            .await?
            .ok_or(Error::Protocol("connection closed during authentication"))?;

        let client = Client {
            stream,
            identity: id.to_string(),
        };
        match response.status() {
            Some(Status::Ok) => Ok((client, false)),
            Some(Status::NewUser) => Ok((client, true)),
            Some(status) => Err(Error::UnexpectedStatus(status)),
            None => Err(Error::Protocol("request frame where a response was expected")),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    async fn round_trip(&mut self, request: Message) -> Result<Message, Error> {
        wire::write_message(&mut self.stream, &request).await?;
        let response = wire::read_response(&mut self.stream)
            .await?
            .ok_or(Error::Protocol("connection closed mid-request"))?;
        if response.correlation_id != request.correlation_id {
            return Err(Error::Protocol("correlation id mismatch"));
        }

        Ok(response)
    }

    /// Cheap membership pre-check before a transfer moves any data.
    async fn verify_access(&mut self, route: &'static str, workspace: &str) -> Result<(), Error> {
        let request = Message::request(route)
            .with_field("action", "verify")
            .with_field("workspace", workspace);
        accepted(&self.round_trip(request).await?)
    }

    /// The upload side of a chunked transfer: declare, push chunks in
    /// order under the transfer id, finalize.
    async fn upload_payload(
        &mut self,
        route: &'static str,
        init_action: &'static str,
        complete_action: &'static str,
        workspace: &str,
        target: &str,
        data: &[u8],
        frame_type: &'static str,
    ) -> Result<(), Error> {
        let init = Message::request(route)
            .with_field("action", init_action)
            .with_field("workspace", workspace)
            .with_field("target", target)
            .with_field("size", data.len().to_string())
            .with_field("chunks", chunk_count(data.len() as u64).to_string());
        let response = self.round_trip(init).await?;
        accepted(&response)?;
        let transfer = required(&response, "transfer")?.to_string();

        for (index, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
            let request = Message::request(route)
                .with_correlation_id(transfer.clone())
                .with_header(HDR_FILE_ID, transfer.clone())
                .with_header(HDR_CHUNK_ID, index.to_string())
                .with_header(HDR_TYPE, frame_type)
                .with_binary(chunk.to_vec());
            accepted(&self.round_trip(request).await?)?;
        }

        let complete = Message::request(route)
            .with_field("action", complete_action)
            .with_field("transfer", transfer);
        accepted(&self.round_trip(complete).await?)
    }

    /// The download side: open, pull every chunk in order, finalize.
    /// Returns the reassembled bytes plus the init response, which
    /// may carry extra fields (e.g. the resolved signature name).
    async fn download_payload(
        &mut self,
        route: &'static str,
        init_action: &'static str,
        chunk_action: &'static str,
        complete_action: &'static str,
        workspace: &str,
        target: &str,
    ) -> Result<(Vec<u8>, Message), Error> {
        let init = Message::request(route)
            .with_field("action", init_action)
            .with_field("workspace", workspace)
            .with_field("target", target);
        let opened = self.round_trip(init).await?;
        accepted(&opened)?;
        let transfer = required(&opened, "transfer")?.to_string();
        let size: u64 = required(&opened, "size")?
            .parse()
            .map_err(|_| Error::Protocol("unparseable size field"))?;
        let chunks: u32 = required(&opened, "chunks")?
            .parse()
            .map_err(|_| Error::Protocol("unparseable chunks field"))?;

        let mut data = Vec::with_capacity(size as usize);
        for index in 0..chunks {
            let request = Message::request(route)
                .with_correlation_id(transfer.clone())
                .with_field("action", chunk_action)
                .with_field("transfer", transfer.clone())
                .with_field("chunk", index.to_string());
            let response = self.round_trip(request).await?;
            accepted(&response)?;
            let Body::Binary(payload) = &response.body else {
                return Err(Error::Protocol("expected a binary chunk"));
            };
            data.extend_from_slice(payload);
        }
        if data.len() as u64 != size {
            return Err(Error::Protocol("reassembled size differs from declared size"));
        }

        let complete = Message::request(route)
            .with_field("action", complete_action)
            .with_field("transfer", transfer);
        accepted(&self.round_trip(complete).await?)?;

        Ok((data, opened))
    }

    /// Create a workspace and seed it: generate a fresh workspace
    /// key, wrap it for ourselves, and store the record server-side.
    pub async fn create_workspace(
        &mut self,
        workspace: &str,
        private_key: &RsaPrivateKey,
    ) -> Result<(), Error> {
        let request = Message::request("createworkspace").with_field("workspace", workspace);
        accepted(&self.round_trip(request).await?)?;

        let (key, salt) = crypto::generate_workspace_key();
        let record = crypto::wrap_key(&key, &salt, &RsaPublicKey::from(private_key))?;
        let member = self.identity.clone();
        self.upload_key(workspace, &member, &record).await
    }

    /// Store a wrapped key record for a member.
    pub async fn upload_key(
        &mut self,
        workspace: &str,
        member: &str,
        record: &WrappedKeyRecord,
    ) -> Result<(), Error> {
        let target = key_record_name(workspace, member);
        self.upload_payload(
            "uploadkeytoworkspace",
            "init",
            "complete",
            workspace,
            &target,
            record.to_text().as_bytes(),
            TYPE_CHUNK,
        )
        .await
    }

    /// Fetch our own wrapped key record for a workspace.
    pub async fn download_key(&mut self, workspace: &str) -> Result<WrappedKeyRecord, Error> {
        let target = key_record_name(workspace, &self.identity.clone());
        let (data, _) = self
            .download_payload(
                "downloadkeyfromworkspace",
                "init",
                "chunk",
                "complete",
                workspace,
                &target,
            )
            .await?;

        let text =
            String::from_utf8(data).map_err(|_| Error::Protocol("key record is not UTF-8"))?;
        WrappedKeyRecord::from_text(&text).ok_or(Error::Protocol("malformed key record"))
    }

    /// Grant another user access: re-wrap the workspace key for them
    /// (same key, same salt), store their record, then ask the server
    /// to add them as a member.
    pub async fn grant_access(
        &mut self,
        workspace: &str,
        member: &str,
        own_key: &RsaPrivateKey,
        member_key: &RsaPublicKey,
    ) -> Result<(), Error> {
        let record = self.download_key(workspace).await?;
        let (key, salt) = crypto::unwrap_key(&record, own_key)?;
        let granted = crypto::wrap_key(&key, &salt, member_key)?;
        self.upload_key(workspace, member, &granted).await?;

        let request = Message::request("addusertoworkspace")
            .with_field("workspace", workspace)
            .with_field("member", member)
            .with_field("key", key_record_name(workspace, member));
        accepted(&self.round_trip(request).await?)
    }

    /// Upload a file and its detached signature, computed over the
    /// exact bytes being stored.
    pub async fn upload_file(
        &mut self,
        workspace: &str,
        name: &str,
        content: &[u8],
        signing_key: &RsaPrivateKey,
    ) -> Result<(), Error> {
        self.verify_access("uploadfiletoworkspace", workspace).await?;
        self.upload_payload(
            "uploadfiletoworkspace",
            "init",
            "complete",
            workspace,
            name,
            content,
            TYPE_CHUNK,
        )
        .await?;

        let signature = crypto::sign_content(signing_key, content)?;
        let target = signature_name(name, &self.identity.clone());
        self.upload_payload(
            "uploadfiletoworkspace",
            "signature_init",
            "signature_complete",
            workspace,
            &target,
            &signature,
            TYPE_SIGNATURE,
        )
        .await
    }

    /// Download a file and its signature into `dest_dir`, then verify
    /// the signature against the signer's key on the keyring. On any
    /// verification failure both artifacts are deleted. Returns the
    /// signer's identity.
    pub async fn download_file(
        &mut self,
        workspace: &str,
        name: &str,
        dest_dir: &Path,
        keyring: &KeyRing,
    ) -> Result<String, Error> {
        self.verify_access("downloadfilefromworkspace", workspace)
            .await?;
        let (content, _) = self
            .download_payload(
                "downloadfilefromworkspace",
                "init",
                "chunk",
                "complete",
                workspace,
                name,
            )
            .await?;
        let (signature, opened) = self
            .download_payload(
                "downloadfilefromworkspace",
                "init_signature",
                "signature_chunk",
                "signature_complete",
                workspace,
                name,
            )
            .await?;

        let sig_name = required(&opened, "signature")?.to_string();
        if !valid_target_name(&sig_name) {
            return Err(Error::Protocol("hostile signature name"));
        }
        let signer = signer_of(&sig_name)
            .ok_or(Error::Protocol("signature name carries no signer"))?
            .to_string();

        let file_path = dest_dir.join(name);
        let sig_path = dest_dir.join(&sig_name);
        tokio::fs::write(&file_path, &content).await?;
        tokio::fs::write(&sig_path, &signature).await?;

        let verified = keyring
            .public_key(&signer)
            .and_then(|key| Ok(crypto::verify_content(&key, &content, &signature)?));
        if let Err(e) = verified {
            // never leave unverifiable content behind
            let _ = tokio::fs::remove_file(&file_path).await;
            let _ = tokio::fs::remove_file(&sig_path).await;
            return match e {
                Error::UnknownSigner(_) => Err(e),
                _ => Err(Error::SignatureInvalid(name.to_string())),
            };
        }

        Ok(signer)
    }

    pub async fn list_workspaces(&mut self) -> Result<Vec<String>, Error> {
        let response = self.round_trip(Message::request("listworkspaces")).await?;
        accepted(&response)?;
        Ok(split_list(required(&response, "workspaces")?))
    }

    pub async fn list_files(&mut self, workspace: &str) -> Result<Vec<String>, Error> {
        let request =
            Message::request("listworkspacefiles").with_field("workspace", workspace);
        let response = self.round_trip(request).await?;
        accepted(&response)?;
        Ok(split_list(required(&response, "files")?))
    }

    pub async fn remove_file(&mut self, workspace: &str, name: &str) -> Result<(), Error> {
        let request = Message::request("removefilefromworkspace")
            .with_field("workspace", workspace)
            .with_field("target", name);
        accepted(&self.round_trip(request).await?)
    }
}
